//! V4L2 camera backend.
//!
//! Uses two handles per device node: a plain one for format and control
//! ioctls, and a second one owned by the self-referential capture state so
//! the mmap stream can borrow it for the lifetime of the stream. V4L2
//! permits multiple opens of one node, and this keeps control traffic
//! possible while streaming.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use ouroboros::self_referencing;
use v4l::buffer::Type as BufferType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

use crate::controls::{ControlDesc, ControlKind};
use crate::device::{storage_key, CameraDevice, CaptureFrame, DeviceFormat, PixelFormat};

const STREAM_BUFFERS: u32 = 4;

pub struct V4l2Device {
    path: String,
    id: String,
    card: Option<String>,
    format: DeviceFormat,
    handle: Option<v4l::Device>,
    state: Option<CaptureState>,
    control_kinds: HashMap<u32, ControlKind>,
}

#[self_referencing]
struct CaptureState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: MmapStream<'this, v4l::Device>,
}

impl V4l2Device {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self {
            id: storage_key(path),
            path: path.to_string(),
            card: None,
            format: DeviceFormat {
                pixel: PixelFormat::Yuyv,
                width: 640,
                height: 480,
                fps: 30.0,
            },
            handle: None,
            state: None,
            control_kinds: HashMap::new(),
        })
    }

    fn handle(&self) -> Result<&v4l::Device> {
        self.handle
            .as_ref()
            .ok_or_else(|| anyhow!("v4l2 device {} is not open", self.path))
    }

    fn handle_mut(&mut self) -> Result<&mut v4l::Device> {
        self.handle
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device {} is not open", self.path))
    }

    /// (Re)builds the capture stream for the current format on a fresh
    /// device handle.
    fn rebuild_stream(&mut self) -> Result<()> {
        self.state = None;

        let mut device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        let wanted = v4l::Format::new(
            self.format.width,
            self.format.height,
            fourcc_for(self.format.pixel),
        );
        let actual = device
            .set_format(&wanted)
            .with_context(|| format!("set format on {}", self.path))?;
        let pixel = pixel_from_fourcc(&actual.fourcc)
            .ok_or_else(|| anyhow!("device picked unsupported format {}", actual.fourcc))?;

        let fps = self.format.fps.round().max(1.0) as u32;
        let params = v4l::video::capture::Parameters::with_fps(fps);
        if let Err(err) = device.set_params(&params) {
            warn!("could not set {fps} fps on {}: {err}", self.path);
        }

        self.format.pixel = pixel;
        self.format.width = actual.width;
        self.format.height = actual.height;

        let state = CaptureStateTryBuilder {
            device,
            stream_builder: |device| {
                MmapStream::with_buffers(device, BufferType::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);
        Ok(())
    }
}

impl CameraDevice for V4l2Device {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        self.card.clone().unwrap_or_else(|| self.path.clone())
    }

    fn source(&self) -> String {
        self.path.clone()
    }

    fn open(&mut self) -> Result<()> {
        let handle = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        match handle.query_caps() {
            Ok(caps) => self.card = Some(caps.card),
            Err(err) => debug!("query_caps failed on {}: {err}", self.path),
        }
        // start from whatever the driver is currently configured for, if
        // it is a format we can decode
        if let Ok(current) = handle.format() {
            if let Some(pixel) = pixel_from_fourcc(&current.fourcc) {
                self.format.pixel = pixel;
                self.format.width = current.width;
                self.format.height = current.height;
            }
        }
        self.handle = Some(handle);
        self.rebuild_stream()?;
        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
        self.handle = None;
    }

    fn formats(&mut self) -> Result<Vec<DeviceFormat>> {
        let handle = self.handle()?;
        let mut formats = Vec::new();
        for desc in handle.enum_formats().context("enumerate formats")? {
            let Some(pixel) = pixel_from_fourcc(&desc.fourcc) else {
                debug!("{}: skipping format {}", self.path, desc.fourcc);
                continue;
            };
            for size in handle
                .enum_framesizes(desc.fourcc)
                .context("enumerate frame sizes")?
            {
                let v4l::framesize::FrameSizeEnum::Discrete(discrete) = size.size else {
                    continue;
                };
                let intervals = handle
                    .enum_frameintervals(size.fourcc, discrete.width, discrete.height)
                    .context("enumerate frame intervals")?;
                for interval in intervals {
                    let v4l::frameinterval::FrameIntervalEnum::Discrete(fraction) =
                        interval.interval
                    else {
                        continue;
                    };
                    if fraction.numerator == 0 {
                        continue;
                    }
                    formats.push(DeviceFormat {
                        pixel,
                        width: discrete.width,
                        height: discrete.height,
                        fps: f64::from(fraction.denominator) / f64::from(fraction.numerator),
                    });
                }
            }
        }
        Ok(formats)
    }

    fn current_format(&self) -> DeviceFormat {
        self.format.clone()
    }

    fn set_format(&mut self, format: &DeviceFormat) -> Result<()> {
        self.format = format.clone();
        if self.handle.is_some() {
            self.rebuild_stream()?;
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CaptureFrame> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device {} is not streaming", self.path))?;
        let data = {
            let (buf, _meta) = state
                .with_mut(|fields| fields.stream.next())
                .context("capture v4l2 frame")?;
            buf.to_vec()
        };
        Ok(CaptureFrame {
            data,
            format: self.format.clone(),
        })
    }

    fn controls(&mut self) -> Result<Vec<ControlDesc>> {
        let descriptions = self.handle()?.query_controls().context("query controls")?;
        let mut out = Vec::new();
        for desc in descriptions {
            let kind = match desc.typ {
                v4l::control::Type::Boolean => ControlKind::Boolean,
                v4l::control::Type::Integer => ControlKind::Integer,
                v4l::control::Type::Menu | v4l::control::Type::IntegerMenu => ControlKind::Menu,
                other => {
                    debug!("{}: skipping {:?} control '{}'", self.path, other, desc.name);
                    continue;
                }
            };
            let menu_items = desc
                .items
                .map(|items| items.into_iter().map(|(_, item)| item.to_string()).collect())
                .unwrap_or_default();
            self.control_kinds.insert(desc.id, kind);
            out.push(ControlDesc {
                id: desc.id,
                name: control_slug(&desc.name),
                kind,
                minimum: desc.minimum,
                maximum: desc.maximum,
                step: desc.step as i64,
                default: desc.default,
                menu_items,
            });
        }
        Ok(out)
    }

    fn control_value(&mut self, id: u32) -> Result<i64> {
        let control = self
            .handle_mut()?
            .control(id)
            .with_context(|| format!("read control {id}"))?;
        match control.value {
            v4l::control::Value::Integer(value) => Ok(value),
            v4l::control::Value::Boolean(value) => Ok(i64::from(value)),
            other => bail!("control {id} has unsupported value {other:?}"),
        }
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        let control_value = match self.control_kinds.get(&id) {
            Some(ControlKind::Boolean) => v4l::control::Value::Boolean(value != 0),
            _ => v4l::control::Value::Integer(value),
        };
        self.handle_mut()?
            .set_control(v4l::control::Control {
                id,
                value: control_value,
            })
            .with_context(|| format!("set control {id}"))?;
        Ok(())
    }
}

fn pixel_from_fourcc(fourcc: &FourCC) -> Option<PixelFormat> {
    PixelFormat::from_fourcc(std::str::from_utf8(&fourcc.repr).ok()?)
}

fn fourcc_for(pixel: PixelFormat) -> FourCC {
    match pixel {
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
    }
}

/// Table entry name for a driver control name, e.g.
/// "White Balance Temperature, Auto" becomes
/// "white_balance_temperature_auto".
fn control_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}
