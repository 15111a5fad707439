use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use parse_size::parse_size;

use dfu::{
    ConsoleReporter, DevicePath, DfuError, DfuseOptions, MatchCriteria, Mode,
    Session, SessionConfig,
};

// BSD sysexits, the exit-code convention dfu-util scripts rely on.
const EX_OK: u8 = 0;
const EX_USAGE: u8 = 64;
const EX_SOFTWARE: u8 = 70;
const EX_CANTCREAT: u8 = 73;
const EX_IOERR: u8 = 74;
const EX_PROTOCOL: u8 = 76;

#[derive(Parser)]
#[command(
    name = "dfu-util",
    version,
    about = "USB Device Firmware Upgrade tool",
    long_about = None
)]
struct Cli {
    /// Print verbose debug statements (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// List currently attached DFU capable devices
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Vendor/product ID(s) of the DFU device
    #[arg(short = 'd', long = "device", value_name = "VID:PID[,VID:PID]")]
    device: Option<String>,

    /// Serial string(s) of the DFU device
    #[arg(short = 'S', long = "serial", value_name = "SERIAL[,SERIAL]")]
    serial: Option<String>,

    /// Position of the device on the host
    #[arg(short = 'p', long = "path", value_name = "BUS-DEVNUM")]
    path: Option<DevicePath>,

    /// Configuration value of the DFU interface (0 = don't care)
    #[arg(short = 'c', long = "cfg", value_name = "CONFIG_NR")]
    config: Option<u8>,

    /// Number of the DFU interface
    #[arg(short = 'i', long = "intf", value_name = "INTF_NR")]
    interface: Option<u8>,

    /// Alternate setting of the DFU interface, by number or by name
    #[arg(short = 'a', long = "alt", value_name = "ALT")]
    alt: Option<String>,

    /// Bytes per USB transfer (e.g. 2048 or 4K)
    #[arg(
        short = 't',
        long = "transfer-size",
        value_parser = transfer_size,
        value_name = "SIZE"
    )]
    transfer_size: Option<u32>,

    /// Read firmware from the device into FILE (FILE must not exist)
    #[arg(short = 'U', long = "upload", value_name = "FILE")]
    upload: Option<PathBuf>,

    /// Write firmware from FILE into the device
    #[arg(short = 'D', long = "download", value_name = "FILE")]
    download: Option<PathBuf>,

    /// Detach the device into DFU mode and exit
    #[arg(short = 'e', long = "detach")]
    detach: bool,

    /// Seconds to wait for re-enumeration after detach
    #[arg(
        short = 'E',
        long = "detach-delay",
        default_value_t = 5,
        value_name = "SECONDS"
    )]
    detach_delay: u64,

    /// Issue USB reset signalling once finished
    #[arg(short = 'R', long = "reset")]
    reset: bool,

    /// Keep probing until a matching device appears
    #[arg(short = 'w', long = "wait")]
    wait: bool,

    /// DfuSe address and modifiers
    #[arg(
        short = 's',
        long = "dfuse-address",
        value_name = "ADDRESS[:leave][:force]"
    )]
    dfuse_address: Option<DfuseOptions>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::from(EX_OK),
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: Cli) -> Result<(), DfuError> {
    let mode = select_mode(&cli)?;
    let criteria = build_criteria(&cli);

    let config = SessionConfig {
        transfer_size: cli.transfer_size,
        final_reset: cli.reset,
        wait_for_device: cli.wait,
        detach_delay: Duration::from_secs(cli.detach_delay),
        dfuse_options: cli.dfuse_address,
        ..SessionConfig::new(mode)
    };

    Session::new(config, criteria).run(&ConsoleReporter)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn select_mode(cli: &Cli) -> Result<Mode, DfuError> {
    let mut modes = Vec::new();
    if cli.list {
        modes.push(Mode::List);
    }
    if let Some(file) = &cli.upload {
        modes.push(Mode::Upload(file.clone()));
    }
    if let Some(file) = &cli.download {
        modes.push(Mode::Download(file.clone()));
    }
    if cli.detach {
        modes.push(Mode::Detach);
    }
    match modes.len() {
        0 => Err(DfuError::Usage(
            "You need to specify one of -l, -U, -D or -e".into(),
        )),
        1 => Ok(modes.pop().unwrap()),
        _ => Err(DfuError::Usage(
            "Only one of -l, -U, -D and -e may be given".into(),
        )),
    }
}

fn build_criteria(cli: &Cli) -> MatchCriteria {
    let mut criteria = MatchCriteria::default();
    if let Some(spec) = &cli.device {
        criteria.apply_device_spec(spec);
    }
    if let Some(spec) = &cli.serial {
        criteria.apply_serial_spec(spec);
    }
    criteria.path = cli.path.clone();
    // "-c 0" addresses an unconfigured device: no constraint
    criteria.config = cli.config.filter(|c| *c != 0);
    criteria.interface = cli.interface;
    match cli.alt.as_deref().map(parse_alt) {
        Some(AltSelector::Number(n)) => criteria.alt_setting = Some(n),
        Some(AltSelector::Name(name)) => criteria.alt_name = Some(name),
        None => {}
    }
    criteria
}

enum AltSelector {
    Number(u8),
    Name(String),
}

/// `--alt` takes a number where one parses, otherwise the value names the
/// alternate setting.
fn parse_alt(value: &str) -> AltSelector {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    match parsed {
        Ok(n) => AltSelector::Number(n),
        Err(_) => AltSelector::Name(value.to_string()),
    }
}

fn transfer_size(value: &str) -> Result<u32, String> {
    let size = parse_size(value).map_err(|e| format!("{e}"))?;
    size.try_into().map_err(|e| format!("{e}"))
}

fn exit_code(err: &DfuError) -> u8 {
    match err {
        DfuError::Usage(_) => EX_USAGE,
        DfuError::OutputExists(_) => EX_CANTCREAT,
        DfuError::StillInRuntime
        | DfuError::RecoveryLoopExceeded
        | DfuError::Status(_)
        | DfuError::Protocol(_) => EX_PROTOCOL,
        DfuError::Internal(_) => EX_SOFTWARE,
        DfuError::NoDevice
        | DfuError::DeviceLost
        | DfuError::Ambiguous(_)
        | DfuError::Usb(_)
        | DfuError::Transfer(_)
        | DfuError::Io(_)
        | DfuError::Timeout => EX_IOERR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfu::MatchValue;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn download_mode_is_selected() {
        let cli = parse(&["dfu-util", "-D", "fw.dfu"]);
        assert_eq!(
            select_mode(&cli).unwrap(),
            Mode::Download(PathBuf::from("fw.dfu"))
        );
    }

    #[test]
    fn missing_mode_is_a_usage_error() {
        let cli = parse(&["dfu-util", "-d", "0483:df11"]);
        assert!(matches!(select_mode(&cli), Err(DfuError::Usage(_))));
    }

    #[test]
    fn conflicting_modes_are_rejected() {
        let cli = parse(&["dfu-util", "-l", "-D", "fw.dfu"]);
        assert!(matches!(select_mode(&cli), Err(DfuError::Usage(_))));
    }

    #[test]
    fn device_spec_reaches_the_criteria() {
        let cli = parse(&["dfu-util", "-l", "-d", "0483:df11", "-c", "1"]);
        let criteria = build_criteria(&cli);
        assert_eq!(criteria.vendor, MatchValue::Id(0x0483));
        assert_eq!(criteria.product, MatchValue::Id(0xdf11));
        assert_eq!(criteria.config, Some(1));
    }

    #[test]
    fn config_zero_means_dont_care() {
        let cli = parse(&["dfu-util", "-l", "-c", "0"]);
        assert_eq!(build_criteria(&cli).config, None);
    }

    #[test]
    fn alt_selector_number_or_name() {
        assert!(matches!(parse_alt("3"), AltSelector::Number(3)));
        assert!(matches!(parse_alt("0x1"), AltSelector::Number(1)));
        assert!(
            matches!(parse_alt("@Internal Flash"), AltSelector::Name(n) if n == "@Internal Flash")
        );
    }

    #[test]
    fn transfer_size_accepts_suffixes() {
        assert_eq!(transfer_size("2048").unwrap(), 2048);
        assert_eq!(transfer_size("4K").unwrap(), 4096);
        assert!(transfer_size("lots").is_err());
    }

    #[test]
    fn dfuse_option_string_is_parsed_by_clap() {
        let cli =
            parse(&["dfu-util", "-D", "fw.dfu", "-s", "0x08000000:leave"]);
        let options = cli.dfuse_address.unwrap();
        assert_eq!(options.address, Some(0x0800_0000));
        assert!(options.leave);
    }

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(exit_code(&DfuError::Usage("x".into())), EX_USAGE);
        assert_eq!(exit_code(&DfuError::NoDevice), EX_IOERR);
        assert_eq!(exit_code(&DfuError::Ambiguous(2)), EX_IOERR);
        assert_eq!(exit_code(&DfuError::StillInRuntime), EX_PROTOCOL);
        assert_eq!(
            exit_code(&DfuError::OutputExists(PathBuf::from("x"))),
            EX_CANTCREAT
        );
        assert_eq!(exit_code(&DfuError::Internal("x")), EX_SOFTWARE);
    }
}
