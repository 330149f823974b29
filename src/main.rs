use clap::{Arg, Command};
use log::LevelFilter;
use mime_filter::config::{Config, DEFAULT_CONFIG_PATH};
use mime_filter::control;
use mime_filter::filter::FilterEngine;
use mime_filter::inspect::{MimeInspector, Verdict};
use mime_filter::output::OutputSender;
use mime_filter::protocol::REGISTRATIONS;
use std::io::Write;
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("mime-filter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OpenSMTPD filter that rejects mail by the sniffed MIME type of its parts")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
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
                .help("Test configuration validity and print a summary")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Inspect an email file and print the verdict")
                .action(clap::ArgAction::Set),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config.level_filter()
    };
    init_logger(config.log_tag(), log_level);
    for warning in config.fallback_warnings() {
        log::warn!("{warning}");
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, email_file);
        return;
    }

    if matches.get_flag("test-config") {
        print_config_summary(config_path, &config);
        return;
    }

    log::info!(
        "Starting mime-filter with {} allowed MIME types",
        config.whitelist().len()
    );

    let engine = FilterEngine::from_config(&config);
    let output = OutputSender::stdout(config.output_queue_size());

    if let Err(e) = output.write_direct(&REGISTRATIONS) {
        log::error!("Failed to register with smtpd: {e}");
        process::exit(1);
    }

    let result = control::run(tokio::io::stdin(), &engine, &output, config.max_line_bytes()).await;

    if let Err(e) = output.shutdown().await {
        log::error!("Output writer did not finish cleanly: {e}");
    }

    match result {
        Ok(()) => log::info!("Control channel closed, exiting"),
        Err(e) => {
            log::error!("Filter stopped: {e:#}");
            process::exit(1);
        }
    }
}

fn init_logger(tag: &str, level: LevelFilter) {
    let tag = tag.to_string();
    let pid = process::id();
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .format(move |buf, record| {
            writeln!(buf, "{}[{}]: [{}] {}", tag, pid, record.level(), record.args())
        })
        .init();
}

fn generate_default_config(path: &str) {
    let config = Config::example();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn print_config_summary(path: &str, config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("✅ Configuration file is valid: {path}");
    println!("   Log tag: {}", config.log_tag());
    println!("   Log level: {}", config.level_filter());

    let whitelist = config.whitelist();
    if whitelist.is_empty() {
        println!("   Allowed MIME types: none (only text parts without filename pass)");
    } else {
        println!("   Allowed MIME types ({}):", whitelist.len());
        for mime_type in whitelist.sorted() {
            println!("     • {mime_type}");
        }
    }

    println!("   Header inspect size: {} bytes", config.header_inspect_size());
    match config.max_inspect_bytes() {
        0 => println!("   Max inspect bytes: disabled"),
        n => println!("   Max inspect bytes: {n}"),
    }
    println!("   Max control line: {} bytes", config.max_line_bytes());
    println!("   Output queue size: {}", config.output_queue_size());
    println!("   Require headers: {}", config.require_headers);
    println!("   Malformed parts: {:?}", config.malformed_parts);
    println!("   Inspect single-part messages: {}", config.inspect_single_part);
}

fn test_email_file(config: &Config, email_file: &str) {
    let content = match std::fs::read(email_file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading email file {email_file}: {e}");
            process::exit(1);
        }
    };

    let mut lines: Vec<Vec<u8>> = content
        .split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l).to_vec())
        .collect();
    if content.ends_with(b"\n") {
        lines.pop();
    }

    println!("📧 Testing email file: {email_file}");
    println!("   Lines: {}", lines.len());

    let inspector = MimeInspector::from_config(config);
    match inspector.inspect(&lines) {
        Verdict::Accept => {
            println!("✅ ACCEPT");
        }
        Verdict::Reject(reason) => {
            println!("❌ REJECT: 550 Policy violation: {reason}");
            process::exit(2);
        }
    }
}
