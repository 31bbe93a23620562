use clap::{Arg, ArgAction, Command};
use log::error;
use std::process::ExitCode;
use webserv::config::{self, Config};
use webserv::server::Server;

fn main() -> ExitCode {
    let matches = Command::new("webserv")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Event-driven HTTP/1.1 server with virtual hosts, uploads and CGI")
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .default_value("config.yaml")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("Log filter (error, warn, info, debug, trace); WEBSERV_LOG overrides it"),
        )
        .arg(
            Arg::new("test")
                .short('t')
                .long("test")
                .action(ArgAction::SetTrue)
                .help("Check the configuration, print a summary and exit"),
        )
        .get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    env_logger::init_from_env(env_logger::Env::new().filter_or("WEBSERV_LOG", level));

    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.yaml");
    let cfg = match config::load(path) {
        Ok(c) => c,
        Err(e) => {
            error!("[Fatal] {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("test") {
        print_summary(path, &cfg);
        return ExitCode::SUCCESS;
    }

    let mut server = match Server::new(cfg) {
        Ok(s) => s,
        Err(e) => {
            error!("[Fatal] {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.bind().and_then(|_| server.run()) {
        error!("[Fatal] {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn print_summary(path: &str, cfg: &Config) {
    println!("{}: configuration OK", path);
    println!("  timeout: {}s, cgi timeout: {}s", cfg.timeout_seconds, cfg.cgi_timeout_seconds);

    for (i, server) in cfg.servers.iter().enumerate() {
        println!("server [{}] {}", i + 1, server.listen_addr());
        if !server.server_names.is_empty() {
            println!("  names:         {}", server.server_names.join(", "));
        }
        println!("  max body size: {} bytes", server.client_max_body_size);

        let mut pages: Vec<_> = server.error_pages.iter().collect();
        pages.sort();
        for (code, page) in pages {
            println!("  error page:    {} -> {}", code, page.display());
        }

        for location in &server.locations {
            println!("  location {}", location.prefix);
            println!("    root:        {}", location.root.display());
            if let Some(methods) = &location.methods {
                let names: Vec<_> = methods.iter().map(|m| m.as_str()).collect();
                println!("    methods:     {}", names.join(", "));
            }
            if !location.index.is_empty() {
                println!("    index:       {}", location.index.join(", "));
            }
            if location.autoindex {
                println!("    autoindex:   on");
            }
            if let Some(redirect) = &location.redirect {
                println!("    redirect:    {} {}", redirect.code, redirect.target);
            }
            if let Some(dir) = &location.upload_dir {
                println!("    upload dir:  {}", dir.display());
            }
            for mapping in &location.cgi {
                let via = mapping
                    .interpreter
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "direct".to_string());
                println!("    cgi:         {} via {}", mapping.extension, via);
            }
        }
    }
}
