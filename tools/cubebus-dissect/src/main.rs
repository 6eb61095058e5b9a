//! Offline dissector for control-bus byte captures.
//!
//! Reads a text dump of bus traffic (whitespace-separated hex bytes, `#`
//! starts a comment) and runs it through the master's own frame codec, so
//! the resynchronization behavior shown here is exactly what a live bus
//! gets. Bytes the codec skips over are reported as noise.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::Parser;
use tokio_util::codec::Decoder;

use cubebus_master::bus::command::{CommandId, ResponseCode};
use cubebus_master::bus::frame::{FrameCodec, RawFrame, FRAME_LEN};

/// Protocol dissector for control-bus captures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture file: whitespace-separated hex bytes, `#` starts a comment
    input: PathBuf,

    /// Show raw hex data for each frame
    #[arg(short = 'x', long)]
    hex: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let text = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let bytes = parse_hex_dump(&text)?;
    dissect(&bytes, args.hex)
}

fn parse_hex_dump(text: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for line in text.lines() {
        let data = line.split('#').next().unwrap_or("");
        for token in data.split_whitespace() {
            let byte = u8::from_str_radix(token, 16)
                .with_context(|| format!("invalid hex byte {token:?}"))?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

fn dissect(bytes: &[u8], show_hex: bool) -> Result<()> {
    let mut buf = BytesMut::from(bytes);
    let mut codec = FrameCodec;
    let total = bytes.len();
    let mut cursor = 0;

    while let Some(frame) = codec.decode(&mut buf)? {
        let consumed = total - buf.len();
        let start = consumed - FRAME_LEN;
        if start > cursor {
            println!("{cursor:06x}  noise ({} bytes)", start - cursor);
        }
        println!("{start:06x}  {}", describe(&frame));
        if show_hex {
            println!("        {}", hex(&bytes[start..consumed]));
        }
        cursor = consumed;
    }

    // Whatever the codec left over never lined up to a valid frame.
    if total > cursor {
        println!("{cursor:06x}  noise ({} bytes)", total - cursor);
    }
    Ok(())
}

fn describe(frame: &RawFrame) -> String {
    if frame.request {
        let command = CommandId::from_repr(frame.code)
            .map(|c| format!("{c:?}"))
            .unwrap_or_else(|| format!("cmd 0x{:02x}", frame.code));
        let target = if frame.broadcast {
            "all    ".to_string()
        } else {
            format!("node {}", frame.address)
        };
        format!("req  {target}  {command:<14} {}", hex(&frame.payload))
    } else {
        let code = ResponseCode::from_repr(frame.code)
            .map(|c| format!("{c:?}"))
            .unwrap_or_else(|| format!("code 0x{:02x}", frame.code));
        format!(
            "resp node {}  {code:<14} {}",
            frame.address,
            hex(&frame.payload)
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
