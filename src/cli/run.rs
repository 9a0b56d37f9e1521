use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use base64::Engine;
use runcell_config::RuncellConfig;
use runcell_core::services::ExecutionServices;
use runcell_protocol::{ExecutionResult, GeneratedFile, MountedFile};
use tracing::{debug, info};

use super::RunOptions;

const FIGURE_FILE_NAME: &str = "figure.png";

pub async fn handle_run_command(config: RuncellConfig, options: RunOptions) -> Result<()> {
    let code = read_source(options.file.as_deref())?;
    let mounts = read_mounts(&options.mounts).await?;

    let services = ExecutionServices::new(config);
    let channel = services.channel();
    if !mounts.is_empty() {
        info!(count = mounts.len(), "mounting files into the sandbox");
        channel
            .mount_files(mounts)
            .await
            .context("failed to mount files into the sandbox")?;
    }

    let result = channel
        .run(code)
        .await
        .context("code execution did not complete")?;
    debug!(status = result.status_str(), "run finished");

    if let Some(dir) = options.save_files.as_deref() {
        save_outputs(dir, &result).await?;
    }

    if options.json {
        let rendered = serde_json::to_string_pretty(&result)
            .context("failed to serialize execution result")?;
        println!("{rendered}");
        return Ok(());
    }

    match result {
        ExecutionResult::Success(success) => {
            if let Some(output) = &success.output {
                println!("{output}");
            }
            if let Some(value) = &success.return_value {
                println!("{value}");
            }
            if success.image.is_some() && options.save_files.is_none() {
                eprintln!("(figure produced; pass --save-files to keep it)");
            }
            for file in &success.generated_files {
                eprintln!("generated {} ({}, {} bytes)", file.name, file.mime_type, file.len());
            }
            Ok(())
        }
        ExecutionResult::Error(failure) => {
            if let Some(output) = &failure.output {
                println!("{output}");
            }
            if let Some(traceback) = &failure.traceback {
                eprintln!("{}", traceback.trim_end());
            }
            bail!("{}", failure.error_message)
        }
    }
}

fn read_source(file: Option<&str>) -> Result<String> {
    match file {
        Some(path) if path != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read source file {path}")),
        maybe_dash => {
            let force_stdin = maybe_dash == Some("-");
            if io::stdin().is_terminal() && !force_stdin {
                bail!("No code provided. Pass a file, pipe input, or use '-' to read from stdin.");
            }
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read code from stdin")?;
            if buffer.trim().is_empty() {
                bail!("No code provided via stdin.");
            }
            Ok(buffer)
        }
    }
}

async fn read_mounts(paths: &[PathBuf]) -> Result<Vec<MountedFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("mount path has no file name: {}", path.display()))?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read mount {}", path.display()))?;
        files.push(MountedFile::new(name, bytes));
    }
    Ok(files)
}

async fn save_outputs(dir: &Path, result: &ExecutionResult) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    for file in result.generated_files() {
        write_generated(dir, file).await?;
    }
    if let Some(image) = result.image() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(image)
            .context("figure payload is not valid base64")?;
        let path = dir.join(FIGURE_FILE_NAME);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

async fn write_generated(dir: &Path, file: &GeneratedFile) -> Result<()> {
    let path = dir.join(&file.name);
    tokio::fs::write(&path, &file.bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
