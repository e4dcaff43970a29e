mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::{Cli, Commands, ConfigAction};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use toolport::catalog::{self, CatalogClient, StatusFilter, ToolView};
use toolport::config::{self, load_config, save_config};
use toolport::download::TransferSettings;
use toolport::events::EventKind;
use toolport::types::{DownloadId, StartRequest, Tool, ToolStatus, ToolportConfig};
use toolport::{ipc, platform, version, DownloadSupervisor, LocalIndex};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let mut config = load_config()?;

    match cli.command {
        Commands::Version => {
            println!("toolport v{}", env!("CARGO_PKG_VERSION"));
        }

        Commands::Tools { filter, search } => {
            let index = open_index(&config)?;
            let tools = catalog_client(&config)?.fetch_tools().await?;
            let views = catalog::tool_views(tools, &index, filter, search.as_deref())?;
            list_catalog_tools(&views);
        }

        Commands::Download { tool_id } => {
            let catalog = catalog_client(&config)?;
            let tool = catalog.find_tool(&tool_id).await?;
            let supervisor = start_supervisor(&config)?;
            let path = download_with_progress(&supervisor, &catalog, &tool).await?;
            println!(
                "{} {} v{} -> {}",
                style("Downloaded").green(),
                tool.name,
                tool.version,
                path.display()
            );
        }

        Commands::Update { tool_id } => {
            let catalog = catalog_client(&config)?;
            let supervisor = start_supervisor(&config)?;
            let tools = catalog.fetch_tools().await?;

            if tool_id == "all" {
                let outdated = catalog::tool_views(
                    tools,
                    supervisor.index(),
                    StatusFilter::NeedUpdate,
                    None,
                )?;
                if outdated.is_empty() {
                    println!("All downloaded tools are up to date.");
                    return Ok(());
                }
                tracing::info!("Updating {} tool(s)...", outdated.len());
                let mut updated_count = 0;
                for view in outdated {
                    match download_with_progress(&supervisor, &catalog, &view.tool).await {
                        Ok(_) => updated_count += 1,
                        Err(e) => tracing::warn!("Failed to update {}: {}", view.tool.name, e),
                    }
                }
                println!("{} tool(s) updated.", updated_count);
            } else {
                let tool = tools
                    .into_iter()
                    .find(|t| t.id == tool_id || t.name.eq_ignore_ascii_case(&tool_id))
                    .ok_or_else(|| anyhow!("Tool '{}' is not in the catalog", tool_id))?;
                match supervisor.index().status_of(&tool)? {
                    ToolStatus::NotDownloaded => {
                        return Err(anyhow!(
                            "{} is not downloaded yet; use `toolport download {}`",
                            tool.name,
                            tool_id
                        ));
                    }
                    ToolStatus::Downloaded => {
                        println!("{} is already up to date (v{}).", tool.name, tool.version);
                    }
                    ToolStatus::NeedUpdate => {
                        let path = download_with_progress(&supervisor, &catalog, &tool).await?;
                        println!(
                            "{} {} to v{} -> {}",
                            style("Updated").green(),
                            tool.name,
                            tool.version,
                            path.display()
                        );
                    }
                }
            }
        }

        Commands::Local => {
            list_local_files(&open_index(&config)?)?;
        }

        Commands::Versions => {
            let versions = open_index(&config)?.versions()?;
            if versions.is_empty() {
                println!("No versions recorded yet.");
            }
            for (tool_id, info) in versions {
                println!("{}: {}", tool_id, info.version);
            }
        }

        Commands::Remove { tool_id } => {
            if open_index(&config)?.remove(&tool_id)? {
                tracing::info!("Removed {}", tool_id);
                println!("Removed {}", tool_id);
            } else {
                return Err(anyhow!("Tool '{}' is not downloaded", tool_id));
            }
        }

        Commands::Open { tool_id } => {
            let record = open_index(&config)?
                .get(&tool_id)?
                .ok_or_else(|| anyhow!("Tool '{}' is not downloaded", tool_id))?;
            platform::open_path(&record.path)?;
        }

        Commands::Compare { version1, version2 } => {
            println!("{}", version::compare_versions(&version1, &version2));
        }

        Commands::CheckUpdate => {
            let check = catalog_client(&config)?.check_update().await?;
            let status = catalog::evaluate_update(env!("CARGO_PKG_VERSION"), &check);
            if status.force_update {
                println!(
                    "{} v{} is required (running v{})",
                    style("Update required:").red().bold(),
                    status.latest_version,
                    status.current_version
                );
            } else if status.needs_update {
                println!(
                    "{} v{} (running v{})",
                    style("Update available:").yellow(),
                    status.latest_version,
                    status.current_version
                );
            } else {
                println!("toolport v{} is up to date.", status.current_version);
            }
            if status.needs_update {
                if let Some(url) = status.download_url {
                    println!("  Download: {}", url);
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Get { key } => {
                if let Some(key) = key {
                    match config::get_setting(&config.settings, &key) {
                        Some(value) => println!("{}", value),
                        None => {
                            return Err(anyhow!(
                                "'{}' is not a valid configuration setting. Valid settings: {}",
                                config::normalize_key(&key),
                                config::VALID_KEYS.join(", ")
                            ))
                        }
                    }
                } else {
                    println!("--- Toolport Settings ---");
                    for key in config::VALID_KEYS {
                        let value = config::get_setting(&config.settings, key).unwrap_or_default();
                        println!("  {}: {}", key, value);
                    }
                }
            }
            ConfigAction::Set { args } => {
                let (key, value) = match args.as_slice() {
                    [pair] => pair
                        .split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .ok_or_else(|| anyhow!("Invalid format. Use 'key=value' or 'key value'."))?,
                    [key, rest @ ..] => (key.clone(), rest.join(" ")),
                    [] => return Err(anyhow!("Missing key and value")),
                };
                config::set_setting(&mut config.settings, &key, &value)?;
                save_config(&config)?;
                tracing::info!("Setting '{}' updated to '{}'", config::normalize_key(&key), value);
            }
            ConfigAction::Unset { key } => {
                config::unset_setting(&mut config.settings, &key)?;
                save_config(&config)?;
                tracing::info!("Setting '{}' unset", config::normalize_key(&key));
            }
            ConfigAction::Show { format } => match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&config)?),
                "yaml" => print!("{}", serde_yaml::to_string(&config)?),
                other => return Err(anyhow!("Unsupported format '{}'. Use json or yaml.", other)),
            },
        },

        Commands::Serve => {
            ipc::serve(config.settings).await?;
        }
    }

    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli.quiet {
        "error"
    } else if cli.verbose == 0 {
        "warn"
    } else if cli.verbose == 1 {
        "info"
    } else {
        "debug"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout belongs to command output and, under `serve`, to the protocol.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    Ok(())
}

fn open_index(config: &ToolportConfig) -> Result<LocalIndex> {
    LocalIndex::open(&config.settings.download_dir).with_context(|| {
        format!(
            "Could not open download directory {}",
            config.settings.download_dir
        )
    })
}

fn catalog_client(config: &ToolportConfig) -> Result<CatalogClient> {
    let settings = &config.settings;
    Ok(CatalogClient::new(
        &settings.catalog_url,
        &settings.update_url,
        settings.counter_url.as_deref(),
    )?)
}

fn start_supervisor(config: &ToolportConfig) -> Result<DownloadSupervisor> {
    let index = Arc::new(open_index(config)?);
    Ok(DownloadSupervisor::new(
        index,
        TransferSettings::from(&config.settings),
    )?)
}

/// Download `tool` and render its progress until it completes, fails or the
/// user presses Ctrl-C.
async fn download_with_progress(
    supervisor: &DownloadSupervisor,
    catalog: &CatalogClient,
    tool: &Tool,
) -> Result<PathBuf> {
    let id = DownloadId::generate();
    let mut events = supervisor.subscribe_job(&id);
    let mut request = StartRequest::for_tool(tool);
    request.download_id = Some(id.clone());
    supervisor.start(request)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Downloading {} v{}", tool.name, tool.version));

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                supervisor.cancel(&id);
                pb.abandon_with_message("Download cancelled");
                return Err(anyhow!("Download of {} cancelled", tool.name));
            }
        };
        let Some(event) = event else {
            pb.abandon();
            return Err(anyhow!("Download supervisor stopped unexpectedly"));
        };

        match event.kind {
            EventKind::Progress {
                downloaded, total, ..
            } => {
                if let Some(total) = total {
                    pb.set_length(total);
                }
                pb.set_position(downloaded);
            }
            EventKind::Restarted { discarded } => {
                tracing::warn!(
                    "Server does not support resuming; discarded {} bytes and started over",
                    discarded
                );
                pb.reset();
            }
            EventKind::Paused { .. } => pb.set_message("Paused"),
            EventKind::Resumed { .. } => {
                pb.set_message(format!("Downloading {} v{}", tool.name, tool.version))
            }
            EventKind::Complete { path, .. } => {
                pb.finish_with_message("Download complete");
                supervisor.clear_finished();
                match catalog.report_download(&tool.id).await {
                    Ok(Some(count)) => tracing::debug!("{} now has {} downloads", tool.name, count),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Could not update download counter: {}", e),
                }
                return Ok(path);
            }
            EventKind::Error { error } => {
                pb.abandon_with_message("Download failed");
                supervisor.cancel(&id);
                return Err(anyhow!("Download of {} failed: {}", tool.name, error));
            }
        }
    }
}

fn status_label(status: ToolStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        ToolStatus::Downloaded => style(text).green(),
        ToolStatus::NeedUpdate => style(text).yellow(),
        ToolStatus::NotDownloaded => style(text).dim(),
    }
}

fn list_catalog_tools(views: &[ToolView]) {
    println!("--- Catalog Tools ---");
    if views.is_empty() {
        println!("  No matching tools.");
        return;
    }
    for view in views {
        let tool = &view.tool;
        println!(
            "  - [{}] {} (v{}) [{}]",
            tool.id,
            tool.name,
            tool.version,
            status_label(view.status)
        );
        if !tool.author.name.is_empty() {
            println!("    Author:    {}", tool.author.name);
        }
        if !tool.release_date.is_empty() {
            println!("    Released:  {}", tool.release_date);
        }
        println!("    Downloads: {}\n", tool.downloads);
    }
    println!("---------------------");
}

fn list_local_files(index: &LocalIndex) -> Result<()> {
    println!("--- Downloaded Tools ---");
    let records = index.list()?;
    if records.is_empty() {
        println!("  No tools downloaded yet.");
        return Ok(());
    }
    for record in records {
        let version = record.version.as_deref().unwrap_or("unrecorded");
        println!("  - {} (v{})", record.tool_id, version);
        println!("    Path:    {}\n", record.path.display());
    }
    println!("------------------------");
    Ok(())
}
