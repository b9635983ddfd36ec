// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, LevelFilter};
use serialport::available_ports;
use simplelog::{ColorChoice, Config, SimpleLogger, TermLogger, TerminalMode};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcumgr_dfu::*;

/// Format bytes to human-readable string
fn format_bytes(size: u32) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = size as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// device name (serial port)
    #[arg(short, long, default_value = "")]
    device: String,

    /// UDP host (use instead of --device for UDP connection)
    #[arg(long)]
    host: Option<String>,

    /// UDP port (default: 1337)
    #[arg(long, default_value_t = 1337)]
    port: u16,

    /// verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// initial timeout in seconds
    #[arg(short = 't', long = "initial_timeout", default_value_t = 60)]
    initial_timeout_s: u32,

    /// subsequent timeout in msec
    #[arg(short = 'u', long = "subsequent_timeout", default_value_t = 200)]
    subsequent_timeout_ms: u32,

    // number of retries per packet
    #[arg(long, default_value_t = 4)]
    nb_retry: u32,

    /// maximum length per line
    #[arg(short, long, default_value_t = 128)]
    linelength: usize,

    /// maximum length per request
    #[arg(short, long, default_value_t = 512)]
    mtu: usize,

    /// baudrate
    #[arg(short, long, default_value_t = 115_200)]
    baudrate: u32,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn conn_spec(&self) -> ConnSpec {
        match &self.host {
            Some(host) => ConnSpec::Udp(UdpSpecs {
                host: host.clone(),
                port: self.port,
                timeout_s: self.initial_timeout_s,
                mtu: self.mtu,
            }),
            None => ConnSpec::Serial(SerialSpecs {
                device: self.device.clone(),
                initial_timeout_s: self.initial_timeout_s,
                subsequent_timeout_ms: self.subsequent_timeout_ms,
                nb_retry: self.nb_retry,
                linelength: self.linelength,
                mtu: self.mtu,
                baudrate: self.baudrate,
            }),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum UpgradeMode {
    Test,
    Confirm,
    TestAndConfirm,
    UploadOnly,
}

impl From<UpgradeMode> for Mode {
    fn from(mode: UpgradeMode) -> Mode {
        match mode {
            UpgradeMode::Test => Mode::TestOnly,
            UpgradeMode::Confirm => Mode::ConfirmOnly,
            UpgradeMode::TestAndConfirm => Mode::TestAndConfirm,
            UpgradeMode::UploadOnly => Mode::None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    // ============== Image Management ==============
    /// list slots on the device
    List,

    /// upload a firmware file to the device
    Upload {
        filename: PathBuf,

        /// image number
        #[arg(short, long, default_value_t = 0)]
        image: u32,

        /// upload requests in flight
        #[arg(short, long, default_value_t = 1)]
        window: usize,
    },

    /// mark an image for testing or confirm it
    Test {
        hash: String,
        #[arg(short, long)]
        confirm: bool,
    },

    /// confirm the running image, or the image with the given hash
    Confirm { hash: Option<String> },

    /// erase an image slot
    Erase {
        #[arg(short, long)]
        slot: Option<u32>,
    },

    /// upload, mark and boot new firmware in one go
    Upgrade {
        /// MCUboot image files, for image 0, 1, ...
        #[arg(required = true)]
        filenames: Vec<PathBuf>,

        #[arg(long, value_enum, default_value_t = UpgradeMode::TestAndConfirm)]
        mode: UpgradeMode,

        /// upload requests in flight
        #[arg(short, long, default_value_t = 1)]
        window: usize,

        /// flash write alignment in bytes
        #[arg(short, long, default_value_t = 1)]
        alignment: usize,

        /// time the bootloader needs to swap images, e.g. "20s"
        #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
        swap_time: Duration,

        /// erase application settings before the final reset
        #[arg(long)]
        erase_settings: bool,
    },

    // ============== OS/Default Management ==============
    /// reset the device
    Reset {
        /// reset even if the application objects
        #[arg(short, long)]
        force: bool,
    },

    /// send an echo request to the device
    Echo {
        /// message to echo
        #[arg(default_value = "hello")]
        message: String,
    },

    /// get task/thread statistics
    Taskstat,

    /// get MCUmgr parameters (buffer size, count)
    McumgrParams,

    /// get OS/application information
    OsInfo {
        /// format string (s=kernel, n=node, r=release, v=version, b=build, m=machine, p=processor, i=platform, o=os, a=all)
        #[arg(short, long, default_value = "a")]
        format: String,
    },

    /// get bootloader information
    BootloaderInfo {
        /// query type (e.g., "mode" for MCUboot mode)
        #[arg(short, long)]
        query: Option<String>,
    },

    // ============== Shell Management ==============
    /// execute a shell command on the device
    Shell {
        /// command and arguments to execute
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    // ============== File System Management ==============
    /// download a file from the device
    FsDownload {
        /// remote file path on device
        remote_path: String,

        /// local file path to save to
        local_path: PathBuf,
    },

    /// upload a file to the device
    FsUpload {
        /// local file path to upload
        local_path: PathBuf,

        /// remote file path on device
        remote_path: String,
    },

    /// get file status (size) from the device
    FsStat {
        /// file path on device
        path: String,
    },

    /// calculate hash/checksum of a file on the device
    FsHash {
        /// file path on device
        path: String,

        /// hash type (e.g., "sha256", "crc32")
        #[arg(short = 't', long)]
        hash_type: Option<String>,
    },

    /// list the hash/checksum types the device supports
    FsHashTypes,

    // ============== Statistics Management ==============
    /// list available statistics groups
    StatList,

    /// read statistics from a specific group
    StatRead {
        /// statistics group name
        name: String,
    },

    // ============== Settings/Config Management ==============
    /// read a settings value
    SettingsRead {
        /// setting name/key
        name: String,

        /// maximum size of value to read
        #[arg(short, long)]
        max_size: Option<u32>,
    },

    /// write a settings value
    SettingsWrite {
        /// setting name/key
        name: String,

        /// value to write (hex string)
        value: String,
    },

    /// delete a settings value
    SettingsDelete {
        /// setting name/key
        name: String,
    },

    /// commit settings to persistent storage
    SettingsCommit,

    /// load settings from persistent storage
    SettingsLoad,

    /// save settings to persistent storage
    SettingsSave,

    /// erase the application storage partition
    EraseStorage,

    // ============== Log Management ==============
    /// show log entries
    LogShow {
        /// log name, all logs if omitted
        name: Option<String>,
    },

    /// clear all logs
    LogClear,
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(1_u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

fn update_bar(pb: &ProgressBar, offset: usize, total: usize) {
    let (offset, total) = (offset as u64, total as u64);
    if pb.length() != Some(total) {
        pb.set_length(total)
    }
    pb.set_position(offset);
    if offset >= total {
        pb.finish_with_message("upload complete");
    }
}

fn main() {
    // show program name and version
    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    println!("{name} {version}");
    println!();

    // parse command line arguments
    let mut cli = Cli::parse();

    // initialize the logger with the desired level filter based on the verbose flag
    let level_filter = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if TermLogger::init(
        level_filter,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        let _ = SimpleLogger::init(LevelFilter::Info, Config::default());
    }

    // If using serial, auto-detect device if not specified
    if cli.host.is_none() && cli.device.is_empty() {
        if let Err(e) = detect_device(&mut cli) {
            error!("{e}");
            process::exit(1);
        }
    }

    let conn = cli.conn_spec();
    if let ConnSpec::Udp(udp) = &conn {
        info!("Using UDP transport: {}:{}", udp.host, udp.port);
    }

    // show error, if failed
    if let Err(e) = conn
        .open()
        .map_err(anyhow::Error::from)
        .and_then(|transport| execute(&cli.command, transport))
    {
        error!("Error: {}", e);
        process::exit(1);
    }
}

fn detect_device(cli: &mut Cli) -> Result<()> {
    let ports = available_ports().map_err(|e| anyhow!("Error listing serial ports: {e}"))?;

    // on Mac, use only special names
    let bootloaders: Vec<String> = ports
        .iter()
        .map(|p| p.port_name.clone())
        .filter(|name| env::consts::OS != "macos" || name.contains("cu.usbmodem"))
        .collect();

    // if there is one bootloader device, then use it
    if let [device] = bootloaders.as_slice() {
        cli.device = device.clone();
        info!("One bootloader device found, setting device to: {}", cli.device);
        return Ok(());
    }
    match ports.as_slice() {
        [] => bail!("No serial port found."),
        [port] => {
            cli.device = port.port_name.clone();
            info!("Only one serial port found, setting device to: {}", cli.device);
            Ok(())
        }
        _ => {
            for p in &ports {
                println!("{}", p.port_name);
            }
            bail!("More than one serial port found, please specify one")
        }
    }
}

/// Reports an upgrade session on the terminal and hands its outcome back
/// to the waiting main thread.
struct UpgradeReporter {
    pb: ProgressBar,
    done: mpsc::Sender<Result<()>>,
}

impl FirmwareUpgradeCallback for UpgradeReporter {
    fn on_state_changed(&mut self, _prev: State, new: State) {
        info!("upgrade state: {:?}", new);
    }

    fn on_upload_progress_changed(&mut self, current: usize, total: usize, _: Instant) {
        update_bar(&self.pb, current, total);
    }

    fn on_upgrade_completed(&mut self) {
        let _ = self.done.send(Ok(()));
    }

    fn on_upgrade_failed(&mut self, state: State, error: mcumgr_dfu::Error) {
        self.pb.abandon();
        let _ = self
            .done
            .send(Err(anyhow!("upgrade failed in state {:?}: {}", state, error)));
    }

    fn on_upgrade_canceled(&mut self, state: State) {
        self.pb.abandon();
        let _ = self
            .done
            .send(Err(anyhow!("upgrade canceled in state {:?}", state)));
    }
}

fn execute(command: &Commands, transport: Arc<dyn Transport>) -> Result<()> {
    match command {
        // ============== Image Management ==============
        Commands::List => {
            let v = ImageManager::new(transport).list()?;
            print!("response: {}", serde_json::to_string_pretty(&v)?);
            Ok(())
        }

        Commands::Upload {
            filename,
            image,
            window,
        } => {
            let data = std::fs::read(filename)?;
            if let Ok(parsed) = McuBootImage::parse(&data) {
                info!("image version {}", parsed.header.version);
            }
            let pb = progress_bar();
            let options = UploadOptions {
                window_capacity: *window,
                ..Default::default()
            };
            ImageManager::new(transport).upload(
                *image,
                data.into(),
                options,
                &TransferController::new(),
                &mut |offset, total, _| update_bar(&pb, offset, total),
            )?;
            Ok(())
        }

        Commands::Test { hash, confirm } => {
            let hash = hex::decode(hash)?;
            let manager = ImageManager::new(transport);
            let v = if *confirm {
                manager.confirm(Some(&hash))?
            } else {
                manager.test(&hash)?
            };
            print!("response: {}", serde_json::to_string_pretty(&v)?);
            Ok(())
        }

        Commands::Confirm { hash } => {
            let hash = hash.as_deref().map(hex::decode).transpose()?;
            let v = ImageManager::new(transport).confirm(hash.as_deref())?;
            print!("response: {}", serde_json::to_string_pretty(&v)?);
            Ok(())
        }

        Commands::Erase { slot } => Ok(ImageManager::new(transport).erase(*slot)?),

        Commands::Upgrade {
            filenames,
            mode,
            window,
            alignment,
            swap_time,
            erase_settings,
        } => {
            let mut images = ImageSet::new();
            for (index, filename) in filenames.iter().enumerate() {
                images.add_binary(index as u32, std::fs::read(filename)?)?;
            }
            let settings = Settings::new(transport)
                .window_capacity(*window)
                .memory_alignment(*alignment)
                .estimated_swap_time(*swap_time)
                .erase_app_settings(*erase_settings);
            let (done, outcome) = mpsc::channel();
            let reporter = UpgradeReporter {
                pb: progress_bar(),
                done,
            };
            let controller =
                FirmwareUpgradeManager::new(settings, reporter).start(images, (*mode).into())?;
            controller.join();
            outcome
                .recv()
                .map_err(|_| anyhow!("upgrade ended without an outcome"))??;
            info!("upgrade complete");
            Ok(())
        }

        // ============== OS/Default Management ==============
        Commands::Reset { force } => Ok(DefaultManager::new(transport).reset(*force)?),

        Commands::Echo { message } => {
            let response = DefaultManager::new(transport).echo(message)?;
            println!("Echo response: {response}");
            Ok(())
        }

        Commands::Taskstat => {
            let stats = DefaultManager::new(transport).taskstat()?;
            println!("Task Statistics:");
            println!("{:<24} {:>5} {:>6} {:>10} {:>10}", "Task", "Prio", "State", "Stack Use", "Stack Size");
            println!("{}", "-".repeat(59));
            for (name, info) in stats.tasks.iter() {
                println!(
                    "{:<24} {:>5} {:>6} {:>10} {:>10}",
                    name, info.prio, info.state, info.stkuse, info.stksiz
                );
            }
            Ok(())
        }

        Commands::McumgrParams => {
            let params = DefaultManager::new(transport).mcumgr_params()?;
            println!("MCUmgr Parameters:");
            println!("  Buffer size:  {}", format_bytes(params.buf_size));
            println!("  Buffer count: {}", params.buf_count);
            Ok(())
        }

        Commands::OsInfo { format } => {
            let info = DefaultManager::new(transport).os_info(Some(format))?;
            println!("OS Information:");
            println!("{info}");
            Ok(())
        }

        Commands::BootloaderInfo { query } => {
            let info = DefaultManager::new(transport).bootloader_info(query.as_deref())?;
            println!("Bootloader Information:");
            println!("  Bootloader: {}", info.bootloader);
            if let Some(mode) = info.mode {
                println!("  Mode: {} ({})", mode, mcuboot_mode_name(mode));
            }
            if let Some(no_downgrade) = info.no_downgrade {
                println!("  Downgrade Prevention: {}", if no_downgrade { "Enabled" } else { "Disabled" });
            }
            Ok(())
        }

        // ============== Shell Management ==============
        Commands::Shell { command } => {
            if command.is_empty() {
                bail!("No command provided");
            }
            let result = ShellManager::new(transport).exec(command.clone())?;
            if !result.o.is_empty() {
                print!("{}", result.o);
            }
            if result.ret != 0 {
                info!("Command exited with code: {}", result.ret);
            }
            Ok(())
        }

        // ============== File System Management ==============
        Commands::FsDownload {
            remote_path,
            local_path,
        } => {
            let pb = progress_bar();
            let data = FsManager::new(transport).download_file(
                remote_path,
                &TransferController::new(),
                &mut |offset, total, _| update_bar(&pb, offset, total),
            )?;
            std::fs::write(local_path, &data)?;
            info!("{} bytes written to {}", data.len(), local_path.display());
            Ok(())
        }

        Commands::FsUpload {
            local_path,
            remote_path,
        } => {
            let data = std::fs::read(local_path)?;
            let pb = progress_bar();
            FsManager::new(transport).upload_file(
                remote_path,
                data.into(),
                UploadOptions::default(),
                &TransferController::new(),
                &mut |offset, total, _| update_bar(&pb, offset, total),
            )?;
            Ok(())
        }

        Commands::FsStat { path } => {
            let result = FsManager::new(transport).stat(path)?;
            println!("File: {path}");
            println!("  Size: {} ({} bytes)", format_bytes(result.len), result.len);
            Ok(())
        }

        Commands::FsHash { path, hash_type } => {
            let result = FsManager::new(transport).hash(path, hash_type.as_deref(), None, None)?;
            println!("File: {path}");
            println!("  Type:   {}", result.hash_type);
            println!("  Offset: {}", result.off);
            println!("  Length: {}", result.len);
            println!("  Hash:   {}", result.output_hex());
            Ok(())
        }

        Commands::FsHashTypes => {
            let result = FsManager::new(transport).supported_hash_types()?;
            println!("Supported hash types:");
            for name in result.types.keys() {
                println!("  {name}");
            }
            Ok(())
        }

        // ============== Statistics Management ==============
        Commands::StatList => {
            let result = StatsManager::new(transport).list()?;
            println!("Available statistics groups:");
            for name in result.stat_list {
                println!("  {name}");
            }
            Ok(())
        }

        Commands::StatRead { name } => {
            let result = StatsManager::new(transport).read(name)?;
            println!("Statistics for '{}':", result.name);
            for (field, value) in result.fields.iter() {
                println!("  {field}: {value}");
            }
            Ok(())
        }

        // ============== Settings/Config Management ==============
        Commands::SettingsRead { name, max_size } => {
            let val = ConfigManager::new(transport).read(name, *max_size)?;
            println!("Setting '{}': {}", name, hex::encode(&val));
            // Try to also print as string if it's valid UTF-8
            if let Ok(s) = std::str::from_utf8(&val) {
                if s.chars().all(|c| c.is_ascii_graphic() || c.is_ascii_whitespace()) {
                    println!("  (as string): {s}");
                }
            }
            Ok(())
        }

        Commands::SettingsWrite { name, value } => {
            let bytes = hex::decode(value).map_err(|e| anyhow!("Invalid hex value: {}", e))?;
            ConfigManager::new(transport).write(name, bytes)?;
            println!("Setting '{name}' written successfully");
            Ok(())
        }

        Commands::SettingsDelete { name } => {
            ConfigManager::new(transport).delete(name)?;
            println!("Setting '{name}' deleted successfully");
            Ok(())
        }

        Commands::SettingsCommit => {
            ConfigManager::new(transport).commit()?;
            println!("Settings committed successfully");
            Ok(())
        }

        Commands::SettingsLoad => {
            ConfigManager::new(transport).load()?;
            println!("Settings loaded successfully");
            Ok(())
        }

        Commands::SettingsSave => {
            ConfigManager::new(transport).save()?;
            println!("Settings saved successfully");
            Ok(())
        }

        Commands::EraseStorage => {
            BasicManager::new(transport).erase_storage()?;
            println!("Storage erased");
            Ok(())
        }

        // ============== Log Management ==============
        Commands::LogShow { name } => {
            for log in LogManager::new(transport).show_all(name.as_deref())? {
                println!("Log '{}':", log.name);
                for entry in log.entries {
                    let msg = match entry.msg {
                        serde_cbor::Value::Text(s) => s,
                        serde_cbor::Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
                        other => format!("{other:?}"),
                    };
                    println!("  [{}] {} {}: {}", entry.index, entry.ts, entry.level, msg);
                }
            }
            Ok(())
        }

        Commands::LogClear => {
            LogManager::new(transport).clear()?;
            println!("Logs cleared");
            Ok(())
        }
    }
}
