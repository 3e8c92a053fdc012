use crate::{
    app::{AcquisitionReport, AddReport, App},
    pool::{CatalogueItem, Category},
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    List,
    Add(Vec<PathBuf>),
    Remove(usize),
    Rename(usize, String),
    Enable(usize),
    Disable(usize),
    Move { from: usize, to: usize },
    Search { term: String, from: usize },
    Deploy,
    Launch,
    SetGame(PathBuf),
    SetRarTool(PathBuf),
    Download(CatalogueItem),
    Paths,
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (format, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("vpksmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let mut app = App::initialize()?;
            if let Some(warning) = app.load_warning() {
                eprintln!("Warning: {warning}; starting with an empty mod list");
            }
            run_command(&mut app, command, format)
        }
    }
}

fn parse_args(args: &[String]) -> Result<(OutputFormat, CliCommand)> {
    let mut format = OutputFormat::Text;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = OutputFormat::parse(value)
                .ok_or_else(|| anyhow!("unknown format {value:?} (use json or text)"))?;
            continue;
        }
        if arg == "--format" {
            let value = iter.next().context("--format requires a value")?;
            format = OutputFormat::parse(value)
                .ok_or_else(|| anyhow!("unknown format {value:?} (use json or text)"))?;
            continue;
        }
        tokens.push(arg.as_str());
    }

    let Some((head, rest)) = tokens.split_first() else {
        return Ok((format, CliCommand::List));
    };
    let command = match *head {
        "list" | "ls" => CliCommand::List,
        "add" => {
            if rest.is_empty() {
                bail!("add requires at least one file");
            }
            CliCommand::Add(rest.iter().map(PathBuf::from).collect())
        }
        "remove" | "rm" => CliCommand::Remove(position_arg(rest, 0, "remove")?),
        "rename" => {
            let position = position_arg(rest, 0, "rename")?;
            let name = rest.get(1..).unwrap_or(&[]).join(" ");
            if name.is_empty() {
                bail!("rename requires a new name");
            }
            CliCommand::Rename(position, name)
        }
        "enable" => CliCommand::Enable(position_arg(rest, 0, "enable")?),
        "disable" => CliCommand::Disable(position_arg(rest, 0, "disable")?),
        "move" | "mv" => CliCommand::Move {
            from: position_arg(rest, 0, "move")?,
            to: position_arg(rest, 1, "move")?,
        },
        "search" => parse_search(rest)?,
        "deploy" => CliCommand::Deploy,
        "launch" | "start" => CliCommand::Launch,
        "set-game" => CliCommand::SetGame(PathBuf::from(
            rest.first().context("set-game requires a folder")?,
        )),
        "set-rar-tool" => CliCommand::SetRarTool(PathBuf::from(
            rest.first().context("set-rar-tool requires a path")?,
        )),
        "download" => {
            let category = rest
                .first()
                .context("download requires a category and an id")?;
            let category = Category::parse(category)
                .ok_or_else(|| anyhow!("only mod and sound entries can be downloaded"))?;
            let id = rest
                .get(1)
                .context("download requires a catalogue id")?
                .parse::<u64>()
                .context("catalogue id must be a number")?;
            CliCommand::Download(CatalogueItem { category, id })
        }
        "paths" => CliCommand::Paths,
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        other => bail!("unknown command {other:?}; see `vpksmith help`"),
    };
    Ok((format, command))
}

fn parse_search(rest: &[&str]) -> Result<CliCommand> {
    let mut from = 0;
    let mut words = Vec::new();
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--from=") {
            from = value.parse().context("--from must be a number")?;
        } else if *arg == "--from" {
            from = iter
                .next()
                .context("--from requires a value")?
                .parse()
                .context("--from must be a number")?;
        } else {
            words.push(*arg);
        }
    }
    if words.is_empty() {
        bail!("search requires a term");
    }
    Ok(CliCommand::Search {
        term: words.join(" "),
        from,
    })
}

fn position_arg(rest: &[&str], index: usize, command: &str) -> Result<usize> {
    let raw = rest
        .get(index)
        .with_context(|| format!("{command} requires a position"))?;
    raw.parse()
        .with_context(|| format!("{command}: {raw:?} is not a position"))
}

fn run_command(app: &mut App, command: CliCommand, format: OutputFormat) -> Result<()> {
    match command {
        CliCommand::List => list_mods(app, format),
        CliCommand::Add(files) => {
            let report = app.add_files(&files, None);
            print_add_report(&report);
            match report.failed {
                Some((path, err)) => Err(err).with_context(|| format!("add {path:?}")),
                None => Ok(()),
            }
        }
        CliCommand::Remove(position) => {
            let entry = app.remove(position)?;
            println!("Removed {}", entry.display_name);
            Ok(())
        }
        CliCommand::Rename(position, name) => {
            let renamed = app.rename(position, &name)?;
            println!("{}", rename_message(position, &name, renamed));
            Ok(())
        }
        CliCommand::Enable(position) => {
            app.set_enabled(position, true)?;
            println!("Enabled {position}");
            Ok(())
        }
        CliCommand::Disable(position) => {
            app.set_enabled(position, false)?;
            println!("Disabled {position}");
            Ok(())
        }
        CliCommand::Move { from, to } => {
            app.move_entry(from, to)?;
            println!("Moved {from} to {to}");
            Ok(())
        }
        CliCommand::Search { term, from } => {
            match app.search_from(&term, from) {
                Some(index) => {
                    let entry = &app.registry().entries()[index];
                    println!("{:>3}. {}", entry.position, entry.display_name);
                    println!("Next search index: {}", app.search_cursor().next_index());
                }
                None => println!("No mods match {term:?}"),
            }
            Ok(())
        }
        CliCommand::Deploy => {
            let report = app.deploy()?;
            println!("Deployed {} mod(s)", report.deployed);
            if report.gameinfo_lines_added > 0 {
                println!("Patched gameinfo.gi ({} line(s) added)", report.gameinfo_lines_added);
            }
            if report.truncated {
                println!("Warning: only the first 99 enabled mods were deployed");
            }
            if report.any_evicted() {
                println!("Missing mod files were dropped from the list:");
            }
            for stale in &report.evicted {
                let note = if stale.persisted { "" } else { " (settings not saved)" };
                println!(
                    "  {} ({}){note}",
                    stale.name,
                    stale.path.display()
                );
            }
            Ok(())
        }
        CliCommand::Launch => app.launch_game(),
        CliCommand::SetGame(folder) => {
            let game = app.set_game_folder(&folder)?;
            println!("Game folder set: {}", game.game_root.display());
            Ok(())
        }
        CliCommand::SetRarTool(path) => {
            app.set_rar_tool(&path)?;
            println!("RAR tool set: {}", path.display());
            Ok(())
        }
        CliCommand::Download(item) => download(app, item),
        CliCommand::Paths => list_paths(app, format),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

fn rename_message(position: usize, name: &str, renamed: bool) -> String {
    if renamed {
        format!("Renamed {position} to {}", name.trim())
    } else {
        format!("Name is blank; {position} left unchanged")
    }
}

fn download(app: &mut App, item: CatalogueItem) -> Result<()> {
    app.request_download(item)?;
    println!("Downloading {item}...");
    while app.has_pending_acquisitions() {
        if let Some(report) = app.wait_for_acquisition(Duration::from_millis(250)) {
            print_acquisition_report(&report);
        }
    }
    Ok(())
}

fn print_add_report(report: &AddReport) {
    if !report.added.is_empty() {
        println!("Added {} mod(s)", report.added.len());
    }
    if report.replaced > 0 {
        println!("Overwrote {} existing file(s)", report.replaced);
    }
    for existing in &report.duplicates {
        println!("Already installed: {}", existing.display());
    }
    for warning in &report.integrity_warnings {
        println!("Warning: {warning}");
    }
    if let Some(err) = &report.save_error {
        println!("Warning: {err}");
    }
}

fn print_acquisition_report(report: &AcquisitionReport) {
    let label = if report.name.is_empty() {
        report.item.to_string()
    } else {
        format!("{} ({})", report.name, report.item)
    };
    println!("Finished {label}");
    print_add_report(&report.add);
    if let Some((path, err)) = &report.add.failed {
        println!("Error adding {}: {err}", path.display());
    }
    if report.download_failed() {
        println!("Failed to download one or more files:");
        for error in &report.download_errors {
            println!("  {error}");
        }
    }
}

#[derive(Serialize)]
struct ModListItem {
    position: usize,
    name: String,
    enabled: bool,
    path: String,
    from_gamebanana: bool,
}

fn list_mods(app: &App, format: OutputFormat) -> Result<()> {
    let items: Vec<ModListItem> = app
        .registry()
        .entries()
        .iter()
        .map(|entry| ModListItem {
            position: entry.position,
            name: entry.display_name.clone(),
            enabled: entry.enabled,
            path: entry.source_path.display().to_string(),
            from_gamebanana: entry.origin.is_catalogue(),
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            if app.registry().is_empty() {
                println!("No mods installed");
            }
            for item in items {
                let enabled = if item.enabled { "x" } else { " " };
                let source = if item.from_gamebanana { "GB" } else { "  " };
                println!(
                    "{position:>3} [{enabled}] {source} {name}",
                    position = item.position,
                    name = item.name
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PathsOutput {
    app_dir: String,
    settings: String,
    log: String,
    game_root: Option<String>,
    addons_dir: Option<String>,
    gameinfo: Option<String>,
    rar_tool: Option<String>,
}

fn list_paths(app: &App, format: OutputFormat) -> Result<()> {
    let game = app.game();
    let output = PathsOutput {
        app_dir: app.dirs.root.display().to_string(),
        settings: app.dirs.settings_path().display().to_string(),
        log: app.dirs.log_path().display().to_string(),
        game_root: game.map(|game| game.game_root.display().to_string()),
        addons_dir: game.map(|game| game.addons_dir.display().to_string()),
        gameinfo: game.map(|game| game.gameinfo_path.display().to_string()),
        rar_tool: app
            .tools()
            .rar_tool
            .as_ref()
            .map(|tool| tool.display().to_string()),
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            let missing = || "not found".to_string();
            println!("App dir: {}", output.app_dir);
            println!("Settings: {}", output.settings);
            println!("Log: {}", output.log);
            println!("Game root: {}", output.game_root.unwrap_or_else(missing));
            println!("Addons: {}", output.addons_dir.unwrap_or_else(missing));
            println!("gameinfo.gi: {}", output.gameinfo.unwrap_or_else(missing));
            println!("RAR tool: {}", output.rar_tool.unwrap_or_else(missing));
        }
    }
    Ok(())
}

fn print_help() {
    println!("vpksmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  vpksmith [list]                  List mods in load order");
    println!("  vpksmith add <files...>          Add .vpk, .zip, .7z or .rar files");
    println!("  vpksmith remove <pos>            Remove a mod and delete its files");
    println!("  vpksmith rename <pos> <name>     Rename a mod");
    println!("  vpksmith enable <pos>            Enable a mod");
    println!("  vpksmith disable <pos>           Disable a mod");
    println!("  vpksmith move <from> <to>        Change load order");
    println!("  vpksmith search <term> [--from <index>]");
    println!("                                   Find the next mod whose name contains term");
    println!("  vpksmith deploy                  Link enabled mods into the game");
    println!("  vpksmith launch                  Start Deadlock");
    println!("  vpksmith set-game <dir>          Set the Deadlock folder");
    println!("  vpksmith set-rar-tool <path>     Set the unrar executable");
    println!("  vpksmith download <mod|sound> <id>");
    println!("                                   Download and add a GameBanana entry");
    println!("  vpksmith paths                   Show detected paths");
    println!();
    println!("Global options:");
    println!("  --format <json|text>             Output format for list and paths");
    println!("  -h, --help                       Show help");
    println!("  -V, --version                    Show version");
    println!();
    println!("Environment:");
    println!("  VPKSMITH_HOME                    Override the application folder");
    println!("  VPKSMITH_LOG                     Log filter (e.g. debug, vpksmith=trace)");
}
