//! Command-line definitions for `isoflash`.
use clap::{ArgAction, Args, Parser, Subcommand};
use isoflash_core::flash::FlashOptions;
use isoflash_core::platform::{Filesystem, FormatOptions, WriteMethod};
use std::path::PathBuf;

const MIB: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "isoflash")]
#[command(about = "Flash ISO and raw disk images onto USB drives and SD cards", version)]
pub struct Cli {
    /// Log more (-v for progress details, -vv for every command run)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Flash an image onto a removable device
    Flash(FlashArgs),
    /// Format a removable device without writing an image
    Format {
        /// Target device (e.g. /dev/sdb); asked for interactively if omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        #[command(flatten)]
        format: FormatArgs,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List available removable devices
    List,
}

#[derive(Args, Debug, Clone)]
pub struct FlashArgs {
    /// Image file to flash
    #[arg(required = true)]
    pub image: PathBuf,

    /// Target device (e.g. /dev/sdb); asked for interactively if omitted
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Skip formatting the device before writing
    #[arg(long = "no-format")]
    pub no_format: bool,

    #[command(flatten)]
    pub format: FormatArgs,

    /// Size of each write, in MiB
    #[arg(long, value_name = "MIB", default_value_t = 4,
          value_parser = clap::value_parser!(u16).range(1..=64))]
    pub chunk_size: u16,

    /// Write through a raw device handle instead of the platform's dd
    #[arg(long, conflicts_with = "dd")]
    pub native: bool,

    /// Write with dd even where a raw device handle is the default (Windows)
    #[arg(long)]
    pub dd: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FormatArgs {
    /// Filesystem to format with: ntfs, fat32 or exfat [default: platform's choice]
    #[arg(long, value_name = "FS")]
    pub filesystem: Option<Filesystem>,

    /// Volume label
    #[arg(long, default_value = FormatOptions::DEFAULT_LABEL)]
    pub label: String,
}

impl FormatArgs {
    pub fn options(&self) -> FormatOptions {
        let mut options = FormatOptions::platform_default();
        if let Some(filesystem) = self.filesystem {
            options.filesystem = filesystem;
        }
        options.label = self.label.clone();
        options
    }
}

impl FlashArgs {
    pub fn format_requested(&self) -> bool {
        !self.no_format
    }

    /// The write method forced by `--native` or `--dd`, if any.
    pub fn write_method(&self) -> Option<WriteMethod> {
        if self.native {
            Some(WriteMethod::Native)
        } else if self.dd {
            Some(WriteMethod::Tool)
        } else {
            None
        }
    }

    pub fn options(&self) -> FlashOptions {
        FlashOptions {
            chunk_size: usize::from(self.chunk_size) * MIB,
            write_method: self.write_method(),
            format: self.format.options(),
        }
    }
}

impl Commands {
    /// The job settings for this subcommand.
    pub fn options(&self) -> FlashOptions {
        match self {
            Commands::Flash(args) => args.options(),
            Commands::Format { format, .. } => FlashOptions {
                format: format.options(),
                ..Default::default()
            },
            Commands::List => FlashOptions::default(),
        }
    }
}
