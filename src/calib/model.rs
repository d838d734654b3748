//! Solver output model.
//!
//! mrcal-style solvers write `camera-N.cameramodel` files: a Python
//! dictionary literal with comments and, at the end, a large binary
//! `optimization_inputs` blob. The daemon only needs a handful of keys, so
//! the parser extracts those by name instead of evaluating the whole
//! literal, and never touches the blob.

use serde::Serialize;

use anyhow::{anyhow, bail, Context, Result};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraModel {
    pub lens_model: String,
    /// fx, fy, cx, cy followed by the lens model's distortion terms.
    pub intrinsics: Vec<f64>,
    pub imager_size: (u32, u32),
    /// rt transform from the reference frame, 6 values; zeros for a
    /// single-camera solve.
    pub extrinsics: Vec<f64>,
    /// Polygon of imager coordinates the intrinsics are trusted in.
    pub valid_intrinsics_region: Vec<(f64, f64)>,
}

pub fn parse_camera_model(text: &str) -> Result<CameraModel> {
    let lens_model = parse_string_value(text, "lensmodel")
        .context("cameramodel missing 'lensmodel'")?;
    let intrinsics = parse_number_list_value(text, "intrinsics")
        .context("cameramodel missing 'intrinsics'")?;
    if intrinsics.len() < 4 {
        bail!(
            "cameramodel 'intrinsics' has {} values, expected at least 4",
            intrinsics.len()
        );
    }
    let imager = parse_number_list_value(text, "imagersize")
        .context("cameramodel missing 'imagersize'")?;
    let [w, h] = imager.as_slice() else {
        bail!(
            "cameramodel 'imagersize' has {} values, expected 2",
            imager.len()
        );
    };
    let extrinsics = match find_value_start(text, "extrinsics") {
        Some(pos) => parse_number_list(text, pos)?,
        None => vec![0.0; 6],
    };

    let region = match find_value_start(text, "valid_intrinsics_region") {
        Some(pos) => {
            let flat = parse_number_list(text, pos)?;
            if flat.len() % 2 != 0 {
                bail!("cameramodel 'valid_intrinsics_region' has an odd value count");
            }
            flat.chunks_exact(2).map(|p| (p[0], p[1])).collect()
        }
        None => Vec::new(),
    };

    Ok(CameraModel {
        lens_model,
        intrinsics,
        imager_size: (as_dimension(*w)?, as_dimension(*h)?),
        extrinsics,
        valid_intrinsics_region: region,
    })
}

fn as_dimension(value: f64) -> Result<u32> {
    if value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
        bail!("cameramodel imager dimension {value} is not a valid size");
    }
    Ok(value as u32)
}

/// Byte offset of the value literal for `'key':`, or None if absent.
fn find_value_start(text: &str, key: &str) -> Option<usize> {
    for quote in ['\'', '"'] {
        let needle = format!("{quote}{key}{quote}");
        let mut from = 0;
        while let Some(rel) = text[from..].find(&needle) {
            let after = from + rel + needle.len();
            let rest = text[after..].trim_start();
            if let Some(stripped) = rest.strip_prefix(':') {
                let value = stripped.trim_start();
                let offset = text.len() - value.len();
                return Some(offset);
            }
            from = after;
        }
    }
    None
}

fn parse_string_value(text: &str, key: &str) -> Result<String> {
    let pos = find_value_start(text, key).ok_or_else(|| anyhow!("key '{key}' not found"))?;
    let rest = &text[pos..];
    let mut chars = rest.char_indices();
    let quote = match chars.next() {
        Some((_, c @ ('\'' | '"'))) => c,
        _ => bail!("value of '{key}' is not a string literal"),
    };
    for (i, c) in chars {
        if c == quote {
            return Ok(rest[1..i].to_string());
        }
    }
    bail!("unterminated string literal for '{key}'")
}

fn parse_number_list_value(text: &str, key: &str) -> Result<Vec<f64>> {
    let pos = find_value_start(text, key).ok_or_else(|| anyhow!("key '{key}' not found"))?;
    parse_number_list(text, pos)
}

/// Reads a bracketed literal at `pos`, flattening nesting and skipping
/// `#` comments, and returns every numeric token inside.
fn parse_number_list(text: &str, pos: usize) -> Result<Vec<f64>> {
    let rest = &text[pos..];
    if !rest.starts_with('[') {
        bail!("expected a list literal, found '{}'", head(rest));
    }
    let mut numbers = Vec::new();
    let mut depth = 0usize;
    let mut token = String::new();
    let mut in_comment = false;
    for ch in rest.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }
        match ch {
            '#' => {
                flush_token(&mut token, &mut numbers)?;
                in_comment = true;
            }
            '[' => depth += 1,
            ']' => {
                flush_token(&mut token, &mut numbers)?;
                depth -= 1;
                if depth == 0 {
                    return Ok(numbers);
                }
            }
            ',' | ' ' | '\t' | '\n' | '\r' => flush_token(&mut token, &mut numbers)?,
            other => token.push(other),
        }
    }
    bail!("unterminated list literal at '{}'", head(rest))
}

fn flush_token(token: &mut String, numbers: &mut Vec<f64>) -> Result<()> {
    if token.is_empty() {
        return Ok(());
    }
    let value: f64 = token
        .parse()
        .with_context(|| format!("non-numeric list element '{token}'"))?;
    numbers.push(value);
    token.clear();
    Ok(())
}

fn head(s: &str) -> &str {
    s.get(..24).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# generated by the calibration solver
{
    'lensmodel':  'LENSMODEL_OPENCV8',

    # intrinsics are fx,fy,cx,cy,distortion0,distortion1,....
    'intrinsics': [ 760.1, # fx
                    761.9,
                    316.2, 239.4,
                    -0.02, 0.01, 0.0, 0.0, 0.003, 0.0, 0.0, 0.0 ],

    'valid_intrinsics_region': [
    [ 0, 0 ],
    [ 640, 0 ],
    [ 640, 480 ],
    [ 0, 480 ] ],

    'extrinsics': [ 0, 0, 0, 0, 0, 0 ],

    'imagersize': [ 640, 480 ],

    'optimization_inputs': b'\x00{]\x27 # not a comment',
}
"#;

    #[test]
    fn extracts_the_published_keys() {
        let model = parse_camera_model(SAMPLE).unwrap();
        assert_eq!(model.lens_model, "LENSMODEL_OPENCV8");
        assert_eq!(model.intrinsics.len(), 12);
        assert!((model.intrinsics[0] - 760.1).abs() < 1e-12);
        assert!((model.intrinsics[3] - 239.4).abs() < 1e-12);
        assert_eq!(model.imager_size, (640, 480));
        assert_eq!(model.extrinsics, vec![0.0; 6]);
        assert_eq!(model.valid_intrinsics_region.len(), 4);
        assert_eq!(model.valid_intrinsics_region[2], (640.0, 480.0));
    }

    #[test]
    fn optional_keys_default_when_absent() {
        let text = "{'lensmodel': 'LENSMODEL_PINHOLE',\n'intrinsics': [500, 500, 320, 240],\n'imagersize': [640, 480]}";
        let model = parse_camera_model(text).unwrap();
        assert_eq!(model.extrinsics, vec![0.0; 6]);
        assert!(model.valid_intrinsics_region.is_empty());
    }

    #[test]
    fn missing_lensmodel_is_an_error() {
        let text = "{'intrinsics': [500, 500, 320, 240], 'imagersize': [640, 480]}";
        let err = parse_camera_model(text).unwrap_err();
        assert!(format!("{err:#}").contains("lensmodel"));
    }

    #[test]
    fn wrong_imagersize_arity_is_an_error() {
        let text =
            "{'lensmodel': 'LENSMODEL_PINHOLE', 'intrinsics': [1, 2, 3, 4], 'imagersize': [640]}";
        let err = parse_camera_model(text).unwrap_err();
        assert!(err.to_string().contains("imagersize"));
    }

    #[test]
    fn garbage_in_a_list_is_an_error() {
        let text = "{'lensmodel': 'x', 'intrinsics': [1, two, 3, 4], 'imagersize': [640, 480]}";
        assert!(parse_camera_model(text).is_err());
    }

    #[test]
    fn double_quoted_keys_are_accepted() {
        let text = "{\"lensmodel\": \"LENSMODEL_PINHOLE\", \"intrinsics\": [1, 2, 3, 4], \"imagersize\": [320, 200]}";
        let model = parse_camera_model(text).unwrap();
        assert_eq!(model.lens_model, "LENSMODEL_PINHOLE");
        assert_eq!(model.imager_size, (320, 200));
    }
}
