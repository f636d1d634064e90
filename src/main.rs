use std::io::BufRead;
use std::path::PathBuf;
use std::thread;

use log::{error, info, warn};
use music_catalog::config::{self, Config};
use music_catalog::protocol::LibraryEvent;
use music_catalog::MusicLibrary;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

const HELP: &str = "commands:
  search <query>
  resolve <artist> | <title> [| <album>]
  match <json object>
  add <folder> | remove <folder> | rescan <folder>
  enable <folder> | disable <folder> | folders | abort
  art <track path>
  fg | bg | clean | quit";

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => warn!("Failed to serialize output: {}", err),
    }
}

fn spawn_event_printer(mut receiver: Receiver<LibraryEvent>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("library-events".to_string())
        .spawn(move || loop {
            match receiver.blocking_recv() {
                Ok(event) => print_json(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event printer lagged, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        })?;
    Ok(())
}

fn load_config() -> Config {
    let config_file = match std::env::args_os().nth(1) {
        Some(path) => Ok(PathBuf::from(path)),
        None => config::default_config_path(),
    };
    match config_file.and_then(|path| config::load_or_create(&path)) {
        Ok(config) => config,
        Err(err) => {
            // The logger is configured from this file, so it is not up yet.
            eprintln!("Failed to load config, using defaults: {err}");
            config::sanitize_config(Config::default())
        }
    }
}

/// Returns false when the loop should stop.
fn handle_command(library: &MusicLibrary, line: &str) -> bool {
    let line = line.trim();
    let (command, argument) = line
        .split_once(char::is_whitespace)
        .map(|(command, rest)| (command, rest.trim()))
        .unwrap_or((line, ""));
    let outcome: music_catalog::Result<()> = match command {
        "" => Ok(()),
        "search" => library
            .search(argument, true)
            .map(|tracks| print_json(&tracks)),
        "resolve" => {
            let parts: Vec<&str> = argument.split('|').map(str::trim).collect();
            let resolved = match parts.as_slice() {
                [artist, title] => library.resolve(artist, title, None, true),
                [artist, title, album] => library.resolve(artist, title, Some(*album), true),
                _ => {
                    println!("usage: resolve <artist> | <title> [| <album>]");
                    Ok(Vec::new())
                }
            };
            resolved.map(|matches| print_json(&matches))
        }
        "match" => match serde_json::from_str::<serde_json::Value>(argument) {
            Ok(value) => library
                .resolve_external(&value, true)
                .map(|matches| print_json(&matches)),
            Err(err) => {
                println!("invalid JSON: {err}");
                Ok(())
            }
        },
        "add" => library.add_folder(argument).map(|folder| print_json(&folder)),
        "remove" => library
            .remove_folder(argument)
            .map(|removed| println!("removed {removed} track(s)")),
        "rescan" => library
            .rescan_folder(argument)
            .map(|summary| print_json(&summary)),
        "enable" | "disable" => library
            .set_folder_enabled(argument, command == "enable")
            .map(|updated| {
                if !updated {
                    println!("unknown folder {argument}");
                }
            }),
        "folders" => library.list_folders().map(|folders| print_json(&folders)),
        "abort" => {
            library.abort_scan();
            Ok(())
        }
        "art" => library.resolve_art(argument).map(|art| match art {
            Some(reference) => println!("{}", reference.to_uri()),
            None => println!("no art"),
        }),
        "fg" => {
            library.on_app_foreground();
            Ok(())
        }
        "bg" => {
            library.on_app_background();
            Ok(())
        }
        "clean" => {
            println!("evicted {} cached image(s)", library.clean_art_cache());
            Ok(())
        }
        "quit" | "exit" => return false,
        _ => {
            println!("{HELP}");
            Ok(())
        }
    };
    if let Err(err) = outcome {
        error!("{} failed: {}", command, err);
    }
    true
}

fn main() {
    let config = load_config();

    let mut clog = colog::default_builder();
    clog.filter(None, config.logging.level_filter());
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let library = match MusicLibrary::init(config) {
        Ok(library) => library,
        Err(err) => {
            error!("Failed to open music library: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = spawn_event_printer(library.subscribe()) {
        warn!("Failed to start event printer: {}", err);
    }
    info!("Ready. Type a command, or anything else for help.");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => {
                if !handle_command(&library, &line) {
                    break;
                }
            }
            Err(err) => {
                warn!("Failed to read stdin: {}", err);
                break;
            }
        }
    }

    library.shutdown();
}
