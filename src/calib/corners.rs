//! Correspondence file I/O.
//!
//! The solver consumes a whitespace-separated table with the header
//! `# filename x y level`. Every retained sample contributes one row per
//! interior board corner, in corner-id order; corners the detector missed
//! are written as `-` placeholders so each sample always spans the same
//! number of rows. Detected corners carry decimation level 0.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use crate::calib::cache::CalibrationSample;

pub const CORNERS_FILE: &str = "corners.vnl";

/// One sample read back from a correspondence file. `corners[id]` is
/// `None` where the file carried a placeholder row.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedSample {
    pub filename: String,
    pub corners: Vec<Option<(f32, f32)>>,
}

pub fn write_corners(
    out: &mut impl Write,
    samples: &[&CalibrationSample],
    corner_count: u32,
) -> Result<()> {
    writeln!(out, "# filename x y level")?;
    for sample in samples {
        let filename = sample
            .image_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                anyhow!(
                    "sample image path has no file name: {}",
                    sample.image_path.display()
                )
            })?;
        let mut by_id: Vec<Option<(f32, f32)>> = vec![None; corner_count as usize];
        for (id, xy) in sample.corner_ids.iter().zip(&sample.corners) {
            if let Some(slot) = by_id.get_mut(*id as usize) {
                *slot = Some(*xy);
            }
        }
        for slot in &by_id {
            match slot {
                Some((x, y)) => writeln!(out, "{filename} {x} {y} 0")?,
                None => writeln!(out, "{filename} - - -")?,
            }
        }
    }
    Ok(())
}

pub fn write_corners_file(
    path: &Path,
    samples: &[&CalibrationSample],
    corner_count: u32,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("create corners file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write_corners(&mut out, samples, corner_count)?;
    out.flush()
        .with_context(|| format!("flush corners file {}", path.display()))
}

/// Parses a correspondence file back into per-sample corner tables.
/// Consecutive rows sharing a filename belong to the same sample.
pub fn parse_corners(reader: impl BufRead) -> Result<Vec<ParsedSample>> {
    let mut samples: Vec<ParsedSample> = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("read corners file")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(filename), Some(xs), Some(ys), Some(_level)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            bail!("corners file line {}: malformed row '{line}'", idx + 1);
        };
        if fields.next().is_some() {
            bail!("corners file line {}: trailing fields in '{line}'", idx + 1);
        }
        let corner = if xs == "-" || ys == "-" {
            None
        } else {
            let x: f32 = xs
                .parse()
                .with_context(|| format!("corners file line {}: bad x '{xs}'", idx + 1))?;
            let y: f32 = ys
                .parse()
                .with_context(|| format!("corners file line {}: bad y '{ys}'", idx + 1))?;
            Some((x, y))
        };
        match samples.last_mut() {
            Some(last) if last.filename == filename => last.corners.push(corner),
            _ => samples.push(ParsedSample {
                filename: filename.to_string(),
                corners: vec![corner],
            }),
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn sample(path: &str, ids: &[u32], corners: &[(f32, f32)]) -> CalibrationSample {
        CalibrationSample {
            score: ids.len() as u32,
            image_path: PathBuf::from(path),
            corner_ids: ids.to_vec(),
            corners: corners.to_vec(),
        }
    }

    #[test]
    fn writes_one_row_per_corner_with_placeholders() {
        let a = sample(
            "/data/video0/640x480/img1.png",
            &[0, 2],
            &[(10.5, 20.25), (30.0, 40.0)],
        );
        let samples = vec![&a];
        let mut buf = Vec::new();
        write_corners(&mut buf, &samples, 4).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "# filename x y level",
                "img1.png 10.5 20.25 0",
                "img1.png - - -",
                "img1.png 30 40 0",
                "img1.png - - -",
            ]
        );
    }

    #[test]
    fn round_trips_through_the_parser() {
        let a = sample("img1.png", &[1, 3], &[(1.5, 2.5), (100.125, 7.0)]);
        let b = sample("img2.png", &[0], &[(9.0, 9.0)]);
        let samples = vec![&a, &b];
        let mut buf = Vec::new();
        write_corners(&mut buf, &samples, 4).unwrap();

        let parsed = parse_corners(Cursor::new(buf)).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].filename, "img1.png");
        assert_eq!(
            parsed[0].corners,
            vec![None, Some((1.5, 2.5)), None, Some((100.125, 7.0))]
        );
        assert_eq!(parsed[1].filename, "img2.png");
        assert_eq!(parsed[1].corners, vec![Some((9.0, 9.0)), None, None, None]);
    }

    #[test]
    fn parser_rejects_short_rows() {
        let text = "# filename x y level\nimg1.png 10.0 20.0\n";
        let err = parse_corners(Cursor::new(text)).unwrap_err();
        assert!(err.to_string().contains("malformed row"));
    }

    #[test]
    fn parser_rejects_non_numeric_coordinates() {
        let text = "img1.png ten 20.0 0\n";
        let err = parse_corners(Cursor::new(text)).unwrap_err();
        assert!(format!("{err:#}").contains("bad x"));
    }

    #[test]
    fn out_of_range_corner_ids_are_ignored() {
        let a = sample("img1.png", &[0, 9], &[(1.0, 1.0), (2.0, 2.0)]);
        let samples = vec![&a];
        let mut buf = Vec::new();
        write_corners(&mut buf, &samples, 2).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("img1.png 1 1 0"));
    }
}
