//! Synthetic `stub://` camera backends.
//!
//! Deterministic generated sources for development and tests: no hardware,
//! no kernel interfaces, reproducible frames. The stub honors the same
//! format and control surface as a real device so the rest of the daemon
//! cannot tell the difference.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::controls::ControlDesc;
use crate::device::{storage_key, CameraDevice, CaptureFrame, DeviceFormat, PixelFormat};

const CTRL_BRIGHTNESS: u32 = 1;
const CTRL_MOTION: u32 = 2;
const CTRL_PALETTE: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pattern {
    Gradient,
    Checker,
    Bars,
}

#[derive(Debug)]
pub struct SyntheticDevice {
    id: String,
    pattern: Pattern,
    format: DeviceFormat,
    controls: HashMap<u32, i64>,
    sequence: u64,
    open: bool,
}

impl SyntheticDevice {
    pub fn new(pattern: &str) -> Result<Self> {
        let kind = match pattern {
            "gradient" => Pattern::Gradient,
            "checker" => Pattern::Checker,
            "bars" => Pattern::Bars,
            other => bail!("unrecognized stub pattern '{other}'"),
        };
        let mut controls = HashMap::new();
        controls.insert(CTRL_BRIGHTNESS, 180);
        controls.insert(CTRL_MOTION, 1);
        controls.insert(CTRL_PALETTE, 0);
        Ok(Self {
            id: storage_key(pattern),
            pattern: kind,
            format: DeviceFormat {
                pixel: PixelFormat::Rgb24,
                width: 640,
                height: 480,
                fps: 30.0,
            },
            controls,
            sequence: 0,
            open: false,
        })
    }

    fn render(&self) -> Vec<u8> {
        let width = self.format.width as usize;
        let height = self.format.height as usize;
        let brightness = self.controls[&CTRL_BRIGHTNESS].clamp(0, 255) as u32;
        let mono = self.controls[&CTRL_PALETTE] != 0;
        let phase = if self.controls[&CTRL_MOTION] != 0 {
            self.sequence as usize
        } else {
            0
        };

        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                let color = match self.pattern {
                    Pattern::Gradient => {
                        let level = ((x + phase) % width) * 255 / width.max(1);
                        let level = (level as u32 * brightness / 255) as u8;
                        [level, level, 255u8.saturating_sub(level)]
                    }
                    Pattern::Checker => {
                        let side = (width.min(height) / 8).max(1);
                        let lit = (x / side + y / side + phase / 8) % 2 == 0;
                        if lit {
                            let level = brightness as u8;
                            [level, (brightness * 3 / 4) as u8, (brightness / 2) as u8]
                        } else {
                            [16, 16, 16]
                        }
                    }
                    Pattern::Bars => {
                        let bar = ((x + phase) % width) * 8 / width.max(1);
                        let [r, g, b] = BAR_COLORS[bar.min(7)];
                        [
                            (r as u32 * brightness / 255) as u8,
                            (g as u32 * brightness / 255) as u8,
                            (b as u32 * brightness / 255) as u8,
                        ]
                    }
                };
                if mono {
                    let luma = (u32::from(color[0]) * 299
                        + u32::from(color[1]) * 587
                        + u32::from(color[2]) * 114)
                        / 1000;
                    data.extend_from_slice(&[luma as u8; 3]);
                } else {
                    data.extend_from_slice(&color);
                }
            }
        }
        data
    }
}

const BAR_COLORS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

impl CameraDevice for SyntheticDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        format!("Synthetic {} pattern", self.id)
    }

    fn source(&self) -> String {
        format!("stub://{}", self.id)
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn formats(&mut self) -> Result<Vec<DeviceFormat>> {
        Ok([(640, 480, 30.0), (320, 240, 30.0), (160, 120, 60.0)]
            .into_iter()
            .map(|(width, height, fps)| DeviceFormat {
                pixel: PixelFormat::Rgb24,
                width,
                height,
                fps,
            })
            .collect())
    }

    fn current_format(&self) -> DeviceFormat {
        self.format.clone()
    }

    fn set_format(&mut self, format: &DeviceFormat) -> Result<()> {
        if !self.formats()?.contains(format) {
            bail!("stub device does not offer {format}");
        }
        self.format = format.clone();
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CaptureFrame> {
        if !self.open {
            bail!("stub device is not open");
        }
        thread::sleep(Duration::from_secs_f64(1.0 / self.format.fps));
        self.sequence += 1;
        Ok(CaptureFrame {
            data: self.render(),
            format: self.format.clone(),
        })
    }

    fn controls(&mut self) -> Result<Vec<ControlDesc>> {
        Ok(vec![
            ControlDesc::integer(CTRL_BRIGHTNESS, "brightness", 0, 255, 1, 180),
            ControlDesc::boolean(CTRL_MOTION, "motion", true),
            ControlDesc::menu(
                CTRL_PALETTE,
                "palette",
                vec!["color".to_string(), "mono".to_string()],
                0,
            ),
        ])
    }

    fn control_value(&mut self, id: u32) -> Result<i64> {
        self.controls
            .get(&id)
            .copied()
            .ok_or_else(|| anyhow!("unknown control id {id}"))
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        match self.controls.get_mut(&id) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => bail!("unknown control id {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::convert::to_rgb;

    #[test]
    fn unknown_patterns_are_rejected() {
        let err = SyntheticDevice::new("plasma").unwrap_err();
        assert!(err.to_string().contains("unrecognized stub pattern"));
    }

    #[test]
    fn frames_match_the_current_format() {
        let mut device = SyntheticDevice::new("checker").unwrap();
        device.open().unwrap();
        let small = DeviceFormat {
            pixel: PixelFormat::Rgb24,
            width: 160,
            height: 120,
            fps: 60.0,
        };
        device.set_format(&small).unwrap();
        let frame = device.next_frame().unwrap();
        assert_eq!(frame.data.len(), 160 * 120 * 3);
        let image = to_rgb(&frame).unwrap();
        assert_eq!((image.width(), image.height()), (160, 120));
    }

    #[test]
    fn closed_devices_do_not_capture() {
        let mut device = SyntheticDevice::new("bars").unwrap();
        assert!(device.next_frame().is_err());
        device.open().unwrap();
        assert!(device.next_frame().is_ok());
        device.close();
        assert!(device.next_frame().is_err());
    }

    #[test]
    fn unsupported_formats_are_rejected() {
        let mut device = SyntheticDevice::new("gradient").unwrap();
        let odd = DeviceFormat {
            pixel: PixelFormat::Yuyv,
            width: 640,
            height: 480,
            fps: 30.0,
        };
        assert!(device.set_format(&odd).is_err());
    }

    #[test]
    fn brightness_darkens_the_checker() {
        let mut device = SyntheticDevice::new("checker").unwrap();
        device.open().unwrap();
        device.set_control(CTRL_MOTION, 0).unwrap();
        device.set_control(CTRL_BRIGHTNESS, 255).unwrap();
        let bright = device.next_frame().unwrap();
        device.set_control(CTRL_BRIGHTNESS, 32).unwrap();
        let dim = device.next_frame().unwrap();
        let sum = |frame: &CaptureFrame| -> u64 {
            frame.data.iter().map(|&b| u64::from(b)).sum()
        };
        assert!(sum(&bright) > sum(&dim));
    }

    #[test]
    fn motion_off_freezes_the_pattern() {
        let mut device = SyntheticDevice::new("gradient").unwrap();
        device.open().unwrap();
        device.set_control(CTRL_MOTION, 0).unwrap();
        let a = device.next_frame().unwrap();
        let b = device.next_frame().unwrap();
        assert_eq!(a.data, b.data);
    }
}
