// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command-line front end for the video decoder: inspects memory negotiation, generates test
//! streams and decodes them into raw frames.

use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use base::info;
use base::syslog;
use base::syslog::LogConfig;
use base::warn;
use bytes::BytesMut;
use vdec::backend::PictureType;
use vdec::decoder::OutputOrder;
use vdec::dummy::StreamWriter;
use vdec::mem_record::allocate_blocks;
use vdec::pool::DisplayBuffer;
use vdec::Codec;
use vdec::ColorFormat;
use vdec::DecodeInput;
use vdec::DecodeOutput;
use vdec::DecodeParams;
use vdec::Decoder;
use vdec::DecoderConfig;
use vdec::Resolution;
use vdec::Severity;

/// Address the tool pretends its memory blocks start at.
const HOST_BASE: u64 = 0x1_0000;
const VERSION_BUFFER_SIZE: usize = 256;

#[derive(FromArgs)]
/// Video decoder tool
struct Args {
    #[argh(option, default = "String::from(\"info\")")]
    /// log filter directives, e.g. `debug` or `vdec::pipeline=trace`
    log_level: String,
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Records(RecordsCommand),
    Generate(GenerateCommand),
    Decode(DecodeCommand),
    Version(VersionCommand),
}

/// Decoder configuration options shared by the subcommands that build a decoder. The config file
/// is read first and the other options override its fields.
#[derive(Default)]
struct ConfigArgs {
    cfg: Option<PathBuf>,
    codec: Option<Codec>,
    width: Option<u32>,
    height: Option<u32>,
    format: Option<ColorFormat>,
    ref_frames: Option<u32>,
    reorder_frames: Option<u32>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "records")]
/// print the memory records a configuration needs
struct RecordsCommand {
    #[argh(option)]
    /// JSON decoder configuration file
    cfg: Option<PathBuf>,
    #[argh(option)]
    /// codec: h264 or mpeg2
    codec: Option<Codec>,
    #[argh(option)]
    /// maximum picture width
    width: Option<u32>,
    #[argh(option)]
    /// maximum picture height
    height: Option<u32>,
    #[argh(option)]
    /// output color format, e.g. yuv420p or nv12
    format: Option<ColorFormat>,
    #[argh(option)]
    /// number of reference frames
    ref_frames: Option<u32>,
    #[argh(option)]
    /// number of reorder frames
    reorder_frames: Option<u32>,
    #[argh(switch)]
    /// print the table as JSON
    json: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "generate")]
/// write a test stream of flat pictures
struct GenerateCommand {
    #[argh(option, default = "64")]
    /// picture width
    width: u16,
    #[argh(option, default = "64")]
    /// picture height
    height: u16,
    #[argh(option, default = "10")]
    /// number of pictures
    frames: u32,
    #[argh(positional)]
    /// output file
    output: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "decode")]
/// decode a stream into raw frames
struct DecodeCommand {
    #[argh(option)]
    /// JSON decoder configuration file
    cfg: Option<PathBuf>,
    #[argh(option)]
    /// codec: h264 or mpeg2
    codec: Option<Codec>,
    #[argh(option)]
    /// maximum picture width
    width: Option<u32>,
    #[argh(option)]
    /// maximum picture height
    height: Option<u32>,
    #[argh(option)]
    /// output color format, e.g. yuv420p or nv12
    format: Option<ColorFormat>,
    #[argh(option)]
    /// number of reference frames
    ref_frames: Option<u32>,
    #[argh(option)]
    /// number of reorder frames
    reorder_frames: Option<u32>,
    #[argh(option, default = "1")]
    /// decoding threads, 1 to 3
    cores: usize,
    #[argh(switch)]
    /// output pictures in decode order
    decode_order: bool,
    #[argh(switch)]
    /// bind output buffers as picture storage instead of copying into them
    shared: bool,
    #[argh(option, short = 'o')]
    /// raw output file
    output: Option<PathBuf>,
    #[argh(positional)]
    /// input stream
    input: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "version")]
/// print the decoder version
struct VersionCommand {}

impl From<&RecordsCommand> for ConfigArgs {
    fn from(c: &RecordsCommand) -> Self {
        ConfigArgs {
            cfg: c.cfg.clone(),
            codec: c.codec,
            width: c.width,
            height: c.height,
            format: c.format,
            ref_frames: c.ref_frames,
            reorder_frames: c.reorder_frames,
        }
    }
}

impl From<&DecodeCommand> for ConfigArgs {
    fn from(c: &DecodeCommand) -> Self {
        ConfigArgs {
            cfg: c.cfg.clone(),
            codec: c.codec,
            width: c.width,
            height: c.height,
            format: c.format,
            ref_frames: c.ref_frames,
            reorder_frames: c.reorder_frames,
        }
    }
}

fn read_config_file(path: &Path) -> Result<DecoderConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Builds the decoder configuration: the config file if any, then command-line overrides.
fn load_config(args: &ConfigArgs) -> Result<DecoderConfig> {
    let mut config = match &args.cfg {
        Some(path) => read_config_file(path)?,
        None => DecoderConfig::default(),
    };
    if let Some(codec) = args.codec {
        config.codec = codec;
    }
    if let Some(width) = args.width {
        config.max_width = width;
    }
    if let Some(height) = args.height {
        config.max_height = height;
    }
    if let Some(format) = args.format {
        config.output_format = format;
    }
    if args.ref_frames.is_some() {
        config.num_ref_frames = args.ref_frames;
    }
    if args.reorder_frames.is_some() {
        config.num_reorder_frames = args.reorder_frames;
    }
    Ok(config)
}

fn print_records(cmd: &RecordsCommand) -> Result<()> {
    let config = load_config(&cmd.into())?;
    let records = Decoder::fill_mem_records(&config).context("memory negotiation failed")?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    let mut total = 0;
    for record in &records {
        println!(
            "{:<24} {:>12} bytes  align {:<4} {:?}",
            record.role.to_string(),
            record.size,
            record.alignment,
            record.class
        );
        total += record.size;
    }
    println!("{} records, {} bytes", records.len(), total);
    Ok(())
}

fn generate(cmd: &GenerateCommand) -> Result<()> {
    let res = Resolution::new(cmd.width as u32, cmd.height as u32);
    let mut writer = StreamWriter::new();
    writer.sequence(cmd.width, cmd.height);
    for i in 0..cmd.frames {
        let picture_type = if i == 0 { PictureType::I } else { PictureType::P };
        let value = (16 + (i * 24) % 200) as u8;
        writer.picture(picture_type, true, 2 * i as i32, res.total_mbs(), value);
    }
    fs::write(&cmd.output, writer.build())
        .with_context(|| format!("failed to write {}", cmd.output.display()))?;
    info!("wrote {} {} pictures to {}", cmd.frames, res, cmd.output.display());
    Ok(())
}

/// Where output pictures land.
enum Frames {
    /// Host planes the decoder converts every output picture into.
    Host(Vec<Vec<u8>>),
    /// Display buffers bound to the decoder's picture slots.
    Shared(Vec<DisplayBuffer>),
}

impl Frames {
    fn new(decoder: &mut Decoder, shared: bool) -> Result<Self> {
        if !shared {
            return Ok(Frames::Host(Vec::new()));
        }
        let info = decoder.get_buffer_info()?;
        let capacity = decoder.holders()?.len();
        let buffers: Vec<DisplayBuffer> = (0..capacity)
            .map(|_| {
                DisplayBuffer::new(
                    info.min_output_sizes[..info.num_output_buffers]
                        .iter()
                        .map(|&size| BytesMut::zeroed(size as usize))
                        .collect(),
                )
            })
            .collect();
        let bound = decoder.set_display_frame(buffers.clone())?;
        if bound == 0 {
            bail!("the configured output format cannot share display buffers");
        }
        for id in 0..bound {
            decoder.release_display_frame(id)?;
        }
        Ok(Frames::Shared(buffers))
    }

    /// Grows the host planes to what the decoder currently needs.
    fn prepare(&mut self, decoder: &Decoder) -> Result<()> {
        if let Frames::Host(planes) = self {
            let info = decoder.get_buffer_info()?;
            planes.resize(info.num_output_buffers, Vec::new());
            for (plane, &size) in planes.iter_mut().zip(&info.min_output_sizes) {
                if plane.len() < size as usize {
                    plane.resize(size as usize, 0);
                }
            }
        }
        Ok(())
    }

    fn input<'a>(&'a mut self, bitstream: &'a [u8], timestamp: u64) -> DecodeInput<'a> {
        let input = DecodeInput::new(bitstream).with_timestamp(timestamp);
        match self {
            Frames::Host(planes) => {
                input.with_output(planes.iter_mut().map(|p| p.as_mut_slice()).collect())
            }
            Frames::Shared(_) => input,
        }
    }

    /// Hands the planes of the picture `out` reported to `sink`, returning shared buffers to the
    /// decoder afterwards.
    fn emit(
        &self,
        decoder: &mut Decoder,
        out: &DecodeOutput,
        sink: &mut impl FnMut(&[&[u8]]) -> Result<()>,
    ) -> Result<()> {
        match self {
            Frames::Host(planes) => {
                let planes: Vec<&[u8]> = planes.iter().map(|p| p.as_slice()).collect();
                sink(&planes)
            }
            Frames::Shared(buffers) => {
                let id = out
                    .buffer_id
                    .context("shared picture without a buffer id")?;
                let buffer = buffers
                    .get(id)
                    .with_context(|| format!("unknown display buffer {}", id))?;
                {
                    let guards: Vec<_> = buffer.planes.iter().map(|p| p.lock()).collect();
                    let planes: Vec<&[u8]> = guards.iter().map(|g| &g[..]).collect();
                    sink(&planes)?;
                }
                decoder.release_display_frame(id)?;
                Ok(())
            }
        }
    }
}

/// Decodes `stream` in one pass, calling `sink` with the planes of every output picture.
fn decode_stream(
    decoder: &mut Decoder,
    stream: &[u8],
    shared: bool,
    mut sink: impl FnMut(&[&[u8]]) -> Result<()>,
) -> Result<u32> {
    let mut frames = Frames::new(decoder, shared)?;
    let mut pos = 0;
    let mut flushing = false;
    let mut calls = 0u64;
    let mut count = 0;
    loop {
        if !flushing && pos >= stream.len() {
            decoder.flush()?;
            flushing = true;
        }
        frames.prepare(decoder)?;
        let bitstream = if flushing { &[][..] } else { &stream[pos..] };
        let out = decoder.decode(frames.input(bitstream, calls))?;
        calls += 1;
        if let Some(err) = out.error {
            warn!("at byte {}: {}", pos, err);
        }
        pos += out.bytes_consumed;
        if out.output_present {
            frames.emit(decoder, &out, &mut sink)?;
            count += 1;
            continue;
        }
        if flushing {
            return Ok(count);
        }
        if out.bytes_consumed == 0 {
            match out.error {
                Some(err) if err.needs_renegotiation() => {
                    bail!("stream outgrew the negotiated resolution: {}", err)
                }
                Some(err) if err.is_fatal() => bail!("decoding failed: {}", err),
                Some(err) if err.is_resolution_change() => {}
                Some(err) if err.severity().contains(Severity::INSUFFICIENT_DATA) => {
                    warn!("dropping {} bytes of incomplete data", stream.len() - pos);
                    pos = stream.len();
                }
                _ => bail!("decoder made no progress at byte {}", pos),
            }
        }
    }
}

fn decode(cmd: &DecodeCommand) -> Result<()> {
    let mut config = load_config(&cmd.into())?;
    if cmd.shared {
        config.share_display_buffers = true;
    }
    let stream =
        fs::read(&cmd.input).with_context(|| format!("failed to read {}", cmd.input.display()))?;

    let mut decoder = Decoder::dummy();
    let records = Decoder::fill_mem_records(&config).context("memory negotiation failed")?;
    decoder
        .init(&config, allocate_blocks(&records, HOST_BASE))
        .context("decoder initialization failed")?;
    decoder.set_num_cores(cmd.cores)?;
    if cmd.decode_order {
        decoder.set_params(DecodeParams {
            output_order: OutputOrder::Decode,
            ..Default::default()
        })?;
    }

    let mut writer = match &cmd.output {
        Some(path) => Some(BufWriter::new(File::create(path).with_context(|| {
            format!("failed to create {}", path.display())
        })?)),
        None => None,
    };
    let shared = config.shares_display_buffers();
    let frames = decode_stream(&mut decoder, &stream, shared, |planes| {
        if let Some(writer) = writer.as_mut() {
            for plane in planes {
                writer.write_all(plane)?;
            }
        }
        Ok(())
    })?;
    if let Some(mut writer) = writer {
        writer.flush()?;
    }

    let status = decoder.get_status()?;
    info!(
        "decoded {} frames of {} ({} output)",
        frames,
        status
            .resolution
            .map_or_else(|| "unknown size".to_string(), |r| r.to_string()),
        status.output_format
    );
    Ok(())
}

fn print_version() -> Result<()> {
    let decoder = Decoder::dummy();
    let mut buf = [0u8; VERSION_BUFFER_SIZE];
    let len = decoder.get_version(&mut buf)?;
    println!("{}", String::from_utf8_lossy(&buf[..len]));
    Ok(())
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    syslog::init_with(LogConfig {
        filter: args.log_level.clone(),
        ..Default::default()
    })
    .context("failed to initialize logging")?;

    match &args.command {
        Command::Records(cmd) => print_records(cmd),
        Command::Generate(cmd) => generate(cmd),
        Command::Decode(cmd) => decode(cmd),
        Command::Version(_) => print_version(),
    }
}
