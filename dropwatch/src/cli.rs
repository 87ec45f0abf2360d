//! # CLI
//!
//! This module defines the command-line interface of `dropwatch` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring frames given as hex are well formed).
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dropwatch_core::{
    frame::DEVICE_STATUS_MESSAGE,
    schema::{DEFAULT_SCHEMA_PATH, SchemaSource},
    session::{DEFAULT_BACKLOG, DEFAULT_HOST, DEFAULT_SOCKET_PATH},
};

#[derive(Parser)]
#[command(
    name = "dropwatch",
    version,
    about = "Live device status monitor for SoundDrop nodes"
)]
pub struct Cli {
    /// The node to connect to (e.g. localhost:8080)
    #[arg(long, global = true, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Read the protobuf.js JSON schema from this file instead of fetching it from the node
    #[arg(long, global = true)]
    pub schema_file: Option<PathBuf>,

    /// Path the node serves its schema at
    #[arg(long, global = true, default_value = DEFAULT_SCHEMA_PATH)]
    pub schema_path: String,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn schema_source(&self) -> SchemaSource {
        match &self.schema_file {
            Some(path) => SchemaSource::File(path.clone()),
            None => SchemaSource::Remote {
                path: self.schema_path.clone(),
            },
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the live status feed of a node
    ///
    /// Every binary frame received on the status socket is decoded and printed as JSON
    /// until the node closes the socket.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// dropwatch --host 192.168.1.20:8080 watch
    /// ```
    Watch {
        /// Path of the status socket on the node
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: String,

        /// Fully qualified message type carried by each frame
        #[arg(long, default_value = DEVICE_STATUS_MESSAGE)]
        message: String,

        /// Frames to hold while the schema is still loading
        #[arg(long, default_value_t = DEFAULT_BACKLOG)]
        backlog: usize,
    },

    /// List all message types defined by the schema
    List,

    /// Describe a message type (show its fields)
    Describe {
        /// Fully qualified message name (e.g. message.WSDeviceStatus)
        #[arg(default_value = DEVICE_STATUS_MESSAGE)]
        message: String,
    },

    /// Decode a single frame given as hex, tag byte included
    Decode {
        /// Frame bytes (e.g. "00 08 64" or 0x000864)
        #[arg(value_parser = parse_hex)]
        frame: HexFrame,

        /// Fully qualified message type carried by the frame
        #[arg(long, default_value = DEVICE_STATUS_MESSAGE)]
        message: String,
    },
}

/// Raw frame bytes parsed from a hex string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexFrame(pub Vec<u8>);

fn parse_hex(value: &str) -> Result<HexFrame, String> {
    let value = value.trim();
    let digits: String = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    if digits.len() % 2 != 0 {
        return Err(format!(
            "Invalid frame '{value}'. Expected an even number of hex digits"
        ));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            let pair = digits.get(i..i + 2).unwrap_or_default();
            u8::from_str_radix(pair, 16).map_err(|_| format!("Invalid hex byte '{pair}'"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(HexFrame)
}
