use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use consoled_frame::{FilterStats, Frame};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One item recovered from a captured serial stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    UserData(Vec<u8>),
}

#[derive(Serialize)]
struct DecodedOutput<'a> {
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_type: Option<&'a str>,
    size: usize,
    payload: String,
}

impl<'a> DecodedOutput<'a> {
    fn from_item(item: &'a Decoded) -> Self {
        match item {
            Decoded::Frame(frame) => Self {
                kind: "frame",
                seq: Some(frame.seq),
                frame_type: Some(frame.frame_type.name()),
                size: frame.payload.len(),
                payload: payload_preview(frame.payload.as_ref()),
            },
            Decoded::UserData(data) => Self {
                kind: "data",
                seq: None,
                frame_type: None,
                size: data.len(),
                payload: payload_preview(data),
            },
        }
    }
}

#[derive(Serialize)]
struct SummaryOutput {
    kind: &'static str,
    frames: u64,
    malformed: u64,
    user_bytes: u64,
    released_partials: u64,
}

pub fn print_decoded(items: &[Decoded], stats: FilterStats, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for item in items {
                println!(
                    "{}",
                    serde_json::to_string(&DecodedOutput::from_item(item))
                        .unwrap_or_else(|_| "{}".to_string())
                );
            }
            let summary = SummaryOutput {
                kind: "summary",
                frames: stats.frames,
                malformed: stats.malformed,
                user_bytes: stats.user_bytes,
                released_partials: stats.released_partials,
            };
            println!(
                "{}",
                serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "SEQ", "TYPE", "SIZE", "PAYLOAD"]);
            for item in items {
                let out = DecodedOutput::from_item(item);
                table.add_row(vec![
                    out.kind.to_string(),
                    out.seq.map(|s| s.to_string()).unwrap_or_default(),
                    out.frame_type.unwrap_or_default().to_string(),
                    out.size.to_string(),
                    out.payload,
                ]);
            }
            println!("{table}");
            println!("{}", summary_line(stats));
        }
        OutputFormat::Pretty => {
            for item in items {
                match item {
                    Decoded::Frame(frame) => println!(
                        "frame seq={} type={} (0x{:02x}) size={}",
                        frame.seq,
                        frame.frame_type.name(),
                        frame.frame_type.as_u8(),
                        frame.payload.len()
                    ),
                    Decoded::UserData(data) => println!(
                        "data size={} payload={}",
                        data.len(),
                        payload_preview(data)
                    ),
                }
            }
            println!("{}", summary_line(stats));
        }
        OutputFormat::Raw => {
            // Raw output reproduces the stream an operator would have seen.
            let mut out = std::io::stdout();
            for item in items {
                if let Decoded::UserData(data) = item {
                    let _ = out.write_all(data);
                }
            }
            let _ = out.flush();
        }
    }
}

fn summary_line(stats: FilterStats) -> String {
    format!(
        "frames={} malformed={} user_bytes={} released_partials={}",
        stats.frames, stats.malformed, stats.user_bytes, stats.released_partials
    )
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}
