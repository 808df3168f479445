use clap::{CommandFactory, Parser};
use isoflash::{Cli, Commands};
use isoflash_core::platform::{Filesystem, FormatOptions, WriteMethod};
use std::path::PathBuf;

#[test]
fn test_cli_parsing_list() {
    let cli = Cli::parse_from(["isoflash", "list"]);
    match cli.command {
        Commands::List => {}
        _ => panic!("List command not parsed correctly"),
    }
    assert_eq!(cli.verbose, 0);
}

#[test]
fn test_cli_parsing_flash_defaults() {
    let cli = Cli::parse_from(["isoflash", "flash", "ubuntu.iso"]);
    let Commands::Flash(args) = &cli.command else {
        panic!("Flash command not parsed correctly");
    };
    assert_eq!(args.image, PathBuf::from("ubuntu.iso"));
    assert_eq!(args.device, None);
    assert!(args.format_requested());
    assert!(!args.yes);

    let options = cli.command.options();
    assert_eq!(options.chunk_size, 4 * 1024 * 1024);
    assert_eq!(options.write_method, None);
    assert_eq!(options.format, FormatOptions::platform_default());
}

#[test]
fn test_cli_parsing_flash_with_flags() {
    let cli = Cli::parse_from([
        "isoflash",
        "-vv",
        "flash",
        "debian.img",
        "--device",
        "/dev/sdb",
        "--no-format",
        "--filesystem",
        "exfat",
        "--label",
        "Boot",
        "--chunk-size",
        "16",
        "--native",
        "-y",
    ]);
    assert_eq!(cli.verbose, 2);
    let Commands::Flash(args) = &cli.command else {
        panic!("Flash command not parsed correctly");
    };
    assert_eq!(args.device, Some(PathBuf::from("/dev/sdb")));
    assert!(!args.format_requested());
    assert!(args.yes);

    let options = args.options();
    assert_eq!(options.chunk_size, 16 * 1024 * 1024);
    assert_eq!(options.write_method, Some(WriteMethod::Native));
    assert_eq!(options.format.filesystem, Filesystem::ExFat);
    assert_eq!(options.format.label, "Boot");
}

#[test]
fn test_cli_parsing_flash_with_dd() {
    let cli = Cli::parse_from(["isoflash", "flash", "win.iso", "--dd"]);
    let Commands::Flash(args) = &cli.command else {
        panic!("Flash command not parsed correctly");
    };
    assert_eq!(args.options().write_method, Some(WriteMethod::Tool));

    assert!(Cli::try_parse_from(["isoflash", "flash", "win.iso", "--dd", "--native"]).is_err());
}

#[test]
fn test_cli_parsing_format() {
    let cli = Cli::parse_from(["isoflash", "format", "--filesystem", "FAT32", "-v"]);
    assert_eq!(cli.verbose, 1);
    let Commands::Format { device, format, yes } = &cli.command else {
        panic!("Format command not parsed correctly");
    };
    assert_eq!(*device, None);
    assert!(!yes);
    assert_eq!(format.options().filesystem, Filesystem::Fat32);
    assert_eq!(format.options().label, "FLASHDRIVE");
}

#[test]
fn test_cli_rejects_bad_values() {
    assert!(Cli::try_parse_from(["isoflash", "flash"]).is_err());
    assert!(Cli::try_parse_from(["isoflash", "flash", "a.iso", "--chunk-size", "0"]).is_err());
    assert!(Cli::try_parse_from(["isoflash", "flash", "a.iso", "--chunk-size", "65"]).is_err());
    assert!(Cli::try_parse_from(["isoflash", "format", "--filesystem", "ext4"]).is_err());
}

#[test]
fn test_cli_command_help() {
    Cli::command().debug_assert();
}
