use clap::{Arg, Command};
use log::LevelFilter;
use scan_milter::config::Config;
use scan_milter::milter::Milter;
use scan_milter::scanner::{ScanRequest, Scanner};
use std::path::PathBuf;
use std::process;

fn main() {
    let matches = Command::new("scan-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter handing messages to clamd, spamd and rspamd with failover")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/scan-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan-file")
                .long("scan-file")
                .value_name("FILE")
                .help("Scan one message file with every configured pool and print the result as JSON")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/scan-milter.yaml");
    let loaded = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    let found = loaded.is_some();
    let config = loaded.unwrap_or_default();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config.log_level().unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("test-config") {
        println!("Testing configuration {config_path}...");
        match config.validate() {
            Ok(()) => {
                println!("clamav servers: {}", config.clamav.servers.len());
                println!("spamd servers: {}", config.spamd.servers.len());
                println!("extra spamd servers: {}", config.spamd.extra_servers.len());
                println!("Configuration is valid.");
            }
            Err(e) => {
                println!("Configuration validation failed:");
                println!("Error: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if let Some(file) = matches.get_one::<String>("scan-file") {
        scan_file(&config, file);
        return;
    }

    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {e:#}");
        process::exit(1);
    }

    if matches.get_flag("daemon") {
        daemonize(&config.pid_file);
    }

    log::info!("Starting scan-milter...");

    // The runtime is built after forking so its worker threads live in the
    // daemon process.
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {e}");
            process::exit(1);
        }
    };
    let milter = match Milter::new(&config) {
        Ok(milter) => milter,
        Err(e) => {
            log::error!("Failed to create milter: {e:#}");
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(milter.run(&config.socket_path)) {
        log::error!("Milter error: {e:#}");
        process::exit(1);
    }
}

/// Reads the configuration file, or `None` if it does not exist. Runs before
/// the logger is set up, so it must not log.
fn load_config(path: &str) -> anyhow::Result<Option<Config>> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path).map(Some)
    } else {
        Ok(None)
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn scan_file(config: &Config, file: &str) {
    let scanner = match Scanner::new(config) {
        Ok(scanner) => scanner,
        Err(e) => {
            eprintln!("Error building upstream pools: {e:#}");
            process::exit(1);
        }
    };
    let request = ScanRequest {
        path: PathBuf::from(file),
        queue_id: "scan-file".to_string(),
        ..Default::default()
    };
    let report = scanner.scan_message(&request);
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error serializing report: {e}");
            process::exit(1);
        }
    }
    if report.has_failures() {
        process::exit(2);
    }
}

#[cfg(unix)]
fn daemonize(pid_file: &str) {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    log::info!("Starting scan-milter in daemon mode...");

    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to fork process");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        log::error!("Failed to create new session");
        process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so the daemon can never reacquire a controlling terminal.
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to second fork");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if unsafe { libc::chdir(c"/".as_ptr()) } == -1 {
        log::warn!("Failed to change working directory to /");
    }
    unsafe {
        libc::umask(0o022);
    }

    if let Ok(dev_null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
        let null_fd = dev_null.as_raw_fd();
        unsafe {
            libc::dup2(null_fd, 0);
            libc::dup2(null_fd, 1);
            libc::dup2(null_fd, 2);
        }
    } else {
        log::warn!("Failed to open /dev/null, closing standard file descriptors");
        unsafe {
            libc::close(0);
            libc::close(1);
            libc::close(2);
        }
    }

    let pid = unsafe { libc::getpid() };
    if let Err(e) = std::fs::write(pid_file, pid.to_string()) {
        log::warn!("Failed to write PID file: {e}");
    } else {
        log::info!("PID file written: {pid_file} ({pid})");
    }

    let pid_file_path = pid_file.to_string();
    let handler = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, cleaning up...");
        if std::path::Path::new(&pid_file_path).exists() {
            if let Err(e) = std::fs::remove_file(&pid_file_path) {
                log::warn!("Failed to remove PID file: {e}");
            } else {
                log::info!("PID file removed");
            }
        }
        process::exit(0);
    });
    if let Err(e) = handler {
        log::error!("Error setting signal handler: {e}");
        process::exit(1);
    }

    log::info!("Daemon mode initialization complete");
}

#[cfg(not(unix))]
fn daemonize(_pid_file: &str) {
    log::warn!("Daemon mode not supported on this platform, running in foreground");
}
