use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use cloakscan::channel::{CatReader, DirectFs, ExternalCommand, FileLister, KernelIterators, ListTool};
use cloakscan::config::{HostPaths, SYSTEM_PATHS, ScanOptions, system_targets};
use cloakscan::disk::DiskImage;
use cloakscan::ebpf::BpfIterators;
use cloakscan::kmod::KmodAnalyzer;
use cloakscan::models::Depth;
use cloakscan::netlink::{NetlinkSocketDumper, TaskStatsClient};
use cloakscan::procs::ProcessScanner;
use cloakscan::reconcile::{reconcile_files, report_files, scan_hidden_content, scan_hidden_files};
use cloakscan::sockets::{self, SocketScanner};
use cloakscan::{fileops, utils, Verdict};

/// Finds files, processes, kernel modules and sockets hidden by rootkits
/// by asking the same question through independent channels.
#[derive(Parser, Debug)]
#[command(name = "cloakscan", version, about, long_about = None)]
struct Cli {
    /// Use `detection` to print only detections
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(short, long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    format: LogFormat,

    /// Pin the kernel iterators under /sys/fs/bpf/cloakscan/ so they can be
    /// read later with cat
    #[arg(long, global = true)]
    pin_kernel_lists: bool,

    /// Directory holding the compiled iterator programs
    #[arg(long, global = true)]
    bpf_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Detection,
}

impl LogLevel {
    /// env_logger directives. Detections are logged at `warn` under their
    /// own target and stay visible at every level.
    fn directives(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error,detection=warn",
            LogLevel::Detection => "off,detection=warn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Timestamped,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a file via syscalls
    Cp { orig: PathBuf, dest: PathBuf },

    /// Move or rename a file via syscalls
    Mv { orig: PathBuf, dest: PathBuf },

    /// Delete files via syscalls
    Rm {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List files via syscalls
    Ls {
        #[arg(short, long)]
        recursive: bool,

        #[arg(long)]
        extended: bool,

        #[arg(default_value = ".")]
        paths: Vec<String>,
    },

    /// Print files via syscalls
    Cat {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the stat block of files or directories
    Stat {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List sockets from the kernel via netlink
    Netstat {
        /// tcp, udp, udplite, icmp, dccp, sctp, igmp, raw (add 6 for IPv6), udp-raw, packet
        #[arg(value_delimiter = ',')]
        protos: Vec<String>,
    },

    /// Read files directly from an ext4 block device or image
    Disk(DiskArgs),

    /// Look for hidden files, content, modules, processes or sockets
    #[command(subcommand)]
    Scan(ScanCommand),

    /// Print what the kernel iterators report
    #[command(subcommand)]
    Dump(DumpCommand),
}

#[derive(Args, Debug)]
struct DiskArgs {
    /// Disk device to read (/dev/sda, disk.img, ...)
    #[arg(short, long)]
    dev: PathBuf,

    /// Partition to read, 0 for the whole device
    #[arg(short, long, default_value_t = 0)]
    partition: usize,

    #[command(subcommand)]
    command: DiskCommand,
}

#[derive(Subcommand, Debug)]
enum DiskCommand {
    /// List directories from the device
    Ls {
        #[arg(short, long)]
        recursive: bool,

        /// Compare with the live `ls` listing of the same path
        #[arg(long)]
        compare: bool,

        #[arg(long)]
        extended: bool,

        #[arg(default_value = "/")]
        path: String,
    },

    /// Copy a file out of the device
    Cp { orig: String, dest: PathBuf },

    /// Filesystem summary and details of each path
    Info { paths: Vec<String> },

    /// Print a file read from the device
    Cat { path: String },
}

#[derive(Subcommand, Debug)]
enum ScanCommand {
    /// Compare a command's listing with a direct syscall listing
    HiddenFiles {
        #[arg(short, long, default_value = "find", value_parser = parse_tool)]
        tool: ListTool,

        #[arg(short, long)]
        recursive: bool,

        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Compare file content read by `cat`, read(2) and mmap(2)
    HiddenContent {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Look for hidden kernel modules
    HiddenLkms,

    /// Look for hidden processes
    HiddenProcs {
        /// Also check every pid up to pid_max
        #[arg(short, long)]
        brute_force: bool,

        /// Unmount bind mounts found over /proc/<pid>
        #[arg(long)]
        unmount: bool,
    },

    /// Look for sockets missing from /proc/net
    HiddenSockets {
        #[arg(value_delimiter = ',')]
        protos: Vec<String>,
    },

    /// Run every check over the built-in list of system paths
    System {
        #[arg(short, long)]
        brute_force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DumpCommand {
    /// Open files of every task
    Files,
    /// Kernel module symbols
    Kmods,
    /// Running tasks
    Tasks,
}

fn parse_tool(value: &str) -> std::result::Result<ListTool, String> {
    value.parse().map_err(|e: cloakscan::CloakError| e.to_string())
}

fn init_logger(level: LogLevel, format: LogFormat) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.directives()))
        .format(move |buf, record| {
            let tag = if record.target() == "detection" {
                String::new()
            } else {
                format!("[{}] ", record.level())
            };
            match format {
                LogFormat::Plain => writeln!(buf, "{}{}", tag, record.args()),
                LogFormat::Timestamped => writeln!(
                    buf,
                    "{} {}{}",
                    chrono::Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                    tag,
                    record.args()
                ),
            }
        })
        .init();
}

/// Shared state of one invocation.
struct Session {
    paths: HostPaths,
    options: ScanOptions,
    cancel: Arc<AtomicBool>,
}

impl Session {
    fn iterators(&self) -> BpfIterators {
        BpfIterators::load(self.options.bpf_dir.as_deref(), self.options.pin_iterators)
    }

    fn self_proc(&self) -> String {
        utils::self_proc_path(&self.paths.proc_root)
    }

    fn scan_procs(&self, iterators: &dyn KernelIterators) -> Verdict {
        let ls = ExternalCommand::new(ListTool::Ls);
        let taskstats = if self.options.brute_force {
            TaskStatsClient::open()
                .map_err(|e| warn!("taskstats unavailable: {}", e))
                .ok()
        } else {
            None
        };

        let mut scanner = ProcessScanner::new(&self.paths, &self.options, &ls, &DirectFs, iterators, &self.cancel);
        if let Some(client) = &taskstats {
            scanner = scanner.with_taskstats(client);
        }
        scanner.scan().verdict
    }

    fn scan_lkms(&self, iterators: &dyn KernelIterators) -> Verdict {
        KmodAnalyzer::new(&self.paths, iterators).analyze().verdict
    }

    fn scan_sockets(&self, iterators: &dyn KernelIterators, protos: &[String]) -> Result<Verdict> {
        let protocols = sockets::select_protocols(protos)?;
        let report = SocketScanner::new(&self.paths, &NetlinkSocketDumper, iterators).check_hidden(&protocols, &CatReader);
        sockets::report_sockets(&report);
        Ok(report.verdict())
    }

    fn scan_system(&self) -> Result<Verdict> {
        let iterators = self.iterators();
        let targets = system_targets(SYSTEM_PATHS);
        info!(
            "Scanning system: {} directories, {} files",
            targets.dirs.len(),
            targets.files.len()
        );

        let verdicts = [
            self.scan_procs(&iterators),
            self.scan_lkms(&iterators),
            self.scan_sockets(&iterators, &[])?,
            scan_hidden_files(
                &targets.dirs,
                &ExternalCommand::new(ListTool::Find),
                &DirectFs,
                Depth::Shallow,
                &self.self_proc(),
            ),
            scan_hidden_content(&targets.files, &CatReader, &DirectFs),
        ];
        Ok(verdicts.into_iter().collect())
    }
}

fn run_disk(ctx: &Session, args: &DiskArgs) -> Result<Verdict> {
    let disk = DiskImage::open(&args.dev, args.partition)
        .with_context(|| format!("unable to open {} partition {}", args.dev.display(), args.partition))?;

    match &args.command {
        DiskCommand::Ls {
            recursive,
            compare,
            extended,
            path,
        } => {
            let depth = Depth::from_recursive(*recursive);
            if !compare {
                return Ok(fileops::list(&disk, std::slice::from_ref(path), depth, *extended));
            }
            let live = ExternalCommand::new(ListTool::Ls)
                .snapshot(path, depth)
                .context("live listing failed")?;
            let on_disk = disk.snapshot(path, depth).context("disk listing failed")?;
            let rec = reconcile_files(live, on_disk, &ctx.self_proc())?;
            report_files(&rec);
            Ok(rec.verdict())
        }
        DiskCommand::Cp { orig, dest } => {
            disk.copy_out(orig, dest)?;
            Ok(Verdict::Ok)
        }
        DiskCommand::Info { paths } => {
            warn!(target: "detection", "{}", disk.superblock());
            for path in paths {
                let meta = disk.stat(path)?;
                warn!(target: "detection", "{}", utils::describe_entry(path, &meta));
                warn!(target: "detection", "\t{}", utils::describe_stat(&meta.stat));
            }
            Ok(Verdict::Ok)
        }
        DiskCommand::Cat { path } => {
            let content = disk.read_file(path)?;
            info!("cat {}:", path);
            warn!(target: "detection", "{}", String::from_utf8_lossy(&content));
            Ok(Verdict::Ok)
        }
    }
}

fn run_dump(ctx: &Session, what: &DumpCommand) -> Result<Verdict> {
    let iterators = ctx.iterators();
    match what {
        DumpCommand::Files => {
            warn!(target: "detection", "{:<10}{:<10}{:<6}{:<10}{:<6}{:<6} {:<16} {}\t{}", "Pid", "PPid", "Fd", "Inode", "UID", "GID", "Comm", "File", "Exe");
            for f in iterators.live_open_files()? {
                warn!(target: "detection", "{:<10}{:<10}{:<6}{:<10}{:<6}{:<6} {:<16} {}\t{}", f.pid, f.ppid, f.fd, f.inode, f.uid, f.gid, f.comm, f.file, f.exe);
            }
        }
        DumpCommand::Kmods => {
            warn!(target: "detection", "{:<20}\t{:<10}\t{}\t{:<18}\t{}", "Name", "Type", "Symbol", "Address", "Function");
            for (name, module) in iterators.live_modules()? {
                if let Some(hook) = module.hook {
                    warn!(target: "detection", "{:<20}\t{:<10}\t{}\t{:#018x}\t{}", name, hook.kind, hook.symbol_type, hook.addr, hook.function);
                }
            }
        }
        DumpCommand::Tasks => {
            warn!(target: "detection", "{:<10}{:<10}{:<10}{:<6}{:<6} {:<16} {}", "Pid", "PPid", "Inode", "UID", "GID", "Comm", "Exe");
            for t in iterators.live_tasks()? {
                warn!(target: "detection", "{:<10}{:<10}{:<10}{:<6}{:<6} {:<16} {}", t.pid, t.ppid, t.inode, t.uid, t.gid, t.comm, t.exe);
            }
        }
    }
    Ok(Verdict::Ok)
}

fn run(cli: &Cli, ctx: &mut Session) -> Result<Verdict> {
    match &cli.command {
        Commands::Cp { orig, dest } => {
            fileops::copy(orig, dest)?;
            Ok(Verdict::Ok)
        }
        Commands::Mv { orig, dest } => {
            fileops::rename(orig, dest)?;
            Ok(Verdict::Ok)
        }
        Commands::Rm { paths } => Ok(fileops::remove(paths)),
        Commands::Ls {
            recursive,
            extended,
            paths,
        } => Ok(fileops::list(&DirectFs, paths, Depth::from_recursive(*recursive), *extended)),
        Commands::Cat { paths } => Ok(fileops::cat(paths)),
        Commands::Stat { paths } => Ok(fileops::stat(paths)),
        Commands::Netstat { protos } => {
            let protocols = sockets::select_protocols(protos)?;
            let iterators = ctx.iterators();
            let scanner = SocketScanner::new(&ctx.paths, &NetlinkSocketDumper, &iterators);
            warn!(target: "detection", "{}", sockets::socket_header());
            for socket in scanner.netstat(&protocols) {
                warn!(target: "detection", "{}", sockets::format_socket(&socket));
            }
            Ok(Verdict::Ok)
        }
        Commands::Disk(args) => run_disk(ctx, args),
        Commands::Scan(scan) => match scan {
            ScanCommand::HiddenFiles {
                tool,
                recursive,
                paths,
            } => {
                ctx.options.tool = *tool;
                ctx.options.depth = Depth::from_recursive(*recursive);
                Ok(scan_hidden_files(
                    paths,
                    &ExternalCommand::new(ctx.options.tool),
                    &DirectFs,
                    ctx.options.depth,
                    &ctx.self_proc(),
                ))
            }
            ScanCommand::HiddenContent { paths } => Ok(scan_hidden_content(paths, &CatReader, &DirectFs)),
            ScanCommand::HiddenLkms => Ok(ctx.scan_lkms(&ctx.iterators())),
            ScanCommand::HiddenProcs { brute_force, unmount } => {
                ctx.options.brute_force = *brute_force;
                ctx.options.unmount_overlays = *unmount;
                Ok(ctx.scan_procs(&ctx.iterators()))
            }
            ScanCommand::HiddenSockets { protos } => ctx.scan_sockets(&ctx.iterators(), protos),
            ScanCommand::System { brute_force } => {
                ctx.options.brute_force = *brute_force;
                ctx.scan_system()
            }
        },
        Commands::Dump(what) => run_dump(ctx, what),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.log_level, cli.format);

    if let Ok(preload) = std::env::var("LD_PRELOAD") {
        warn!(target: "detection", "\tWARNING!!\nLD_PRELOAD env var found: {}", preload);
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("unable to install the Ctrl-C handler: {}", e);
    }

    let mut ctx = Session {
        paths: HostPaths::default(),
        options: ScanOptions {
            bpf_dir: cli.bpf_dir.clone(),
            pin_iterators: cli.pin_kernel_lists,
            ..ScanOptions::default()
        },
        cancel,
    };

    let verdict = match run(&cli, &mut ctx) {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("{:#}", e);
            Verdict::Error
        }
    };
    info!("result: {} ({})", verdict, verdict.exit_code());
    std::process::exit(verdict.exit_code());
}
