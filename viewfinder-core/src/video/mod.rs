//! video — FFmpeg-backed camera stand-in and annotated-video writer
//!
//! [`VideoSource`] decodes a file one frame at a time so it can act as a live
//! camera ([`FrameSource`]). [`VideoWriter`] encodes annotated frames to
//! H.264; its encoder opens lazily on the first frame because the output size
//! (the view) is only known then.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, decoder, encoder, format, frame, media, software::scaling, util::rational::Rational};
use tracing::{debug, info};

use crate::camera::{FrameSource, RgbFrame};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

// ── Decoding ─────────────────────────────────────────────────────────────────

pub struct VideoSource {
    input: format::context::Input,
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    frame_rate: Option<f64>,
    frame_count: Option<u64>,
    decoded: frame::Video,
    rgb: frame::Video,
    draining: bool,
    frames: u64,
}

impl VideoSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let path = path.as_ref();
        let input = format::input(&path)
            .with_context(|| format!("could not open video {}", path.display()))?;

        let stream = input
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();
        let rate = stream.avg_frame_rate();
        let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0)
            .then(|| rate.numerator() as f64 / rate.denominator() as f64);
        let frame_count = estimate_frame_count(&stream);

        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let (width, height, pixel_fmt) = (decoder.width(), decoder.height(), decoder.format());
        info!(width, height, ?pixel_fmt, ?frame_rate, ?frame_count, "opened input video stream");

        let to_rgb = scaling::Context::get(
            pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        Ok(Self {
            input,
            decoder,
            to_rgb,
            stream_index,
            frame_rate,
            frame_count,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            draining: false,
            frames: 0,
        })
    }

    /// A frame the decoder already has ready, if any.
    fn receive(&mut self) -> Result<Option<RgbFrame>> {
        if self.decoder.receive_frame(&mut self.decoded).is_err() {
            return Ok(None);
        }
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        let (width, height) = (self.rgb.width(), self.rgb.height());
        let row_bytes = width as usize * 3;
        let stride = self.rgb.stride(0);
        let plane = self.rgb.data(0);
        // Strip stride padding.
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend_from_slice(&plane[start..start + row_bytes]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frames as i64);
        self.frames += 1;
        if self.frames % 100 == 0 {
            debug!(frames = self.frames, "decoded frames");
        }
        Ok(Some(RgbFrame {
            data,
            width,
            height,
            pts,
        }))
    }
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if let Some(frame) = self.receive()? {
                return Ok(Some(frame));
            }
            if self.draining {
                return Ok(None);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("decoder send_packet")?;
                    }
                }
                None => {
                    self.decoder.send_eof().ok();
                    self.draining = true;
                }
            }
        }
    }

    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }
}

/// Approximate frame count of a stream: the container's count, else
/// duration × frame rate.
fn estimate_frame_count(stream: &format::stream::Stream) -> Option<u64> {
    if stream.frames() > 0 {
        return Some(stream.frames() as u64);
    }
    let (duration, tb, fps) = (stream.duration(), stream.time_base(), stream.avg_frame_rate());
    if duration > 0 && tb.denominator() > 0 && fps.numerator() > 0 && fps.denominator() > 0 {
        let seconds = duration as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps = fps.numerator() as f64 / fps.denominator() as f64;
        return Some((seconds * fps).round() as u64).filter(|n| *n > 0);
    }
    None
}

// ── Encoding ─────────────────────────────────────────────────────────────────

struct EncoderState {
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb: frame::Video,
    yuv: frame::Video,
    stream_index: usize,
    width: u32,
    height: u32,
}

pub struct VideoWriter {
    output: format::context::Output,
    path: PathBuf,
    time_base: Rational,
    frame_rate: Rational,
    state: Option<EncoderState>,
    frames: i64,
}

impl VideoWriter {
    /// Create an H.264 writer at `fps` frames per second.
    pub fn create<P: AsRef<Path>>(path: P, fps: f64) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let path = path.as_ref().to_path_buf();
        let output = format::output(&path)
            .with_context(|| format!("could not create output {}", path.display()))?;
        let fps = fps.round().clamp(1.0, 240.0) as i32;
        Ok(Self {
            output,
            path,
            time_base: Rational::new(1, fps),
            frame_rate: Rational::new(fps, 1),
            state: None,
            frames: 0,
        })
    }

    fn open_encoder(&mut self, width: u32, height: u32) -> Result<EncoderState> {
        let codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found; is FFmpeg built with libx264?")?;
        let global_header = self
            .output
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let mut stream = self.output.add_stream(codec)?;
        let mut builder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(self.time_base);
        builder.set_frame_rate(Some(self.frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = builder
            .open_as_with(
                codec,
                ffmpeg::Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;
        stream.set_parameters(&encoder);
        let stream_index = stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        self.output
            .write_header()
            .context("failed to write output header")?;
        info!(width, height, path = %self.path.display(), "video writer opened");

        Ok(EncoderState {
            encoder,
            to_yuv,
            rgb: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv: frame::Video::empty(),
            stream_index,
            width,
            height,
        })
    }

    pub fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        anyhow::ensure!(
            !frame.is_empty(),
            "frame {}x{} has {} bytes of RGB data",
            frame.width,
            frame.height,
            frame.data.len()
        );
        if self.state.is_none() {
            let state = self.open_encoder(frame.width, frame.height)?;
            self.state = Some(state);
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        anyhow::ensure!(
            frame.width == state.width && frame.height == state.height,
            "frame size {}x{} differs from video size {}x{}",
            frame.width,
            frame.height,
            state.width,
            state.height
        );

        let row_bytes = state.width as usize * 3;
        let stride = state.rgb.stride(0);
        let plane = state.rgb.data_mut(0);
        for row in 0..state.height as usize {
            plane[row * stride..row * stride + row_bytes]
                .copy_from_slice(&frame.data[row * row_bytes..(row + 1) * row_bytes]);
        }

        state
            .to_yuv
            .run(&state.rgb, &mut state.yuv)
            .context("to-YUV scaling failed")?;
        state.yuv.set_pts(Some(self.frames));
        self.frames += 1;
        state
            .encoder
            .send_frame(&state.yuv)
            .context("encoder send_frame")?;
        drain_packets(&mut state.encoder, &mut self.output, state.stream_index, self.time_base)
    }

    /// Flush the encoder and finalise the file.
    pub fn finish(mut self) -> Result<u64> {
        let Some(mut state) = self.state.take() else {
            anyhow::bail!("no frames were written to {}", self.path.display());
        };
        state.encoder.send_eof().ok();
        drain_packets(&mut state.encoder, &mut self.output, state.stream_index, self.time_base)?;
        self.output
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(frames = self.frames, path = %self.path.display(), "video written");
        Ok(self.frames as u64)
    }
}

fn drain_packets(
    encoder: &mut encoder::Video,
    output: &mut format::context::Output,
    stream_index: usize,
    time_base: Rational,
) -> Result<()> {
    let out_time_base = output
        .stream(stream_index)
        .context("encoder output stream missing")?
        .time_base();
    let mut packet = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(time_base, out_time_base);
        packet
            .write_interleaved(output)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}
