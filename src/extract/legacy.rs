//! Legacy binary `.doc` files, converted to DOCX by an external office suite
//! and then read with the DOCX extractor.
//!
//! Every call gets its own scratch directory which is removed on all exit
//! paths, including timeouts. The converter is killed when it outlives
//! [`ExtractOptions::converter_timeout`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;
use url::Url;

use super::{docx, run_blocking, ExtractError, ExtractOptions, ExtractedDocument};

pub async fn extract(path: &Path, options: &ExtractOptions) -> Result<ExtractedDocument, ExtractError> {
    let scratch = scratch_dir(options)?;
    let converted = convert_to_docx(path, scratch.path(), options).await?;
    run_blocking(&converted, docx::extract).await
}

fn scratch_dir(options: &ExtractOptions) -> Result<TempDir, ExtractError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("convert-");
    let created = match &options.scratch_dir {
        Some(parent) => std::fs::create_dir_all(parent).and_then(|_| builder.tempdir_in(parent)),
        None => builder.tempdir(),
    };
    created.map_err(|err| ExtractError::Conversion(format!("failed to create scratch directory: {err}")))
}

async fn convert_to_docx(
    input: &Path,
    outdir: &Path,
    options: &ExtractOptions,
) -> Result<PathBuf, ExtractError> {
    let stem = input
        .file_stem()
        .ok_or_else(|| ExtractError::Conversion(format!("{} has no file name", input.display())))?;
    let program = options.converter_program.as_str();

    let mut command = Command::new(program);
    command
        .arg(profile_arg(outdir)?)
        .arg("--headless")
        .arg("--convert-to")
        .arg("docx")
        .arg("--outdir")
        .arg(outdir)
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ExtractError::Conversion(format!("converter `{program}` is not installed"))
        } else {
            ExtractError::Conversion(format!("failed to start `{program}`: {err}"))
        }
    })?;

    // Dropping the child on timeout kills it.
    let output = match timeout(options.converter_timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|err| ExtractError::Conversion(format!("`{program}` failed: {err}")))?
        }
        Err(_) => {
            tracing::warn!(
                program,
                input = %input.display(),
                timeout_secs = options.converter_timeout.as_secs(),
                "converter timed out"
            );
            return Err(ExtractError::ConversionTimeout {
                seconds: options.converter_timeout.as_secs(),
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractError::Conversion(format!(
            "`{program}` exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    // Only the final `.doc` is replaced; dots inside the stem stay.
    let mut file_name = stem.to_os_string();
    file_name.push(".docx");
    let converted = outdir.join(file_name);
    if !converted.is_file() {
        return Err(ExtractError::Conversion(format!(
            "`{program}` produced no output at {}",
            converted.display()
        )));
    }
    Ok(converted)
}

/// Concurrent office-suite instances must not share a user profile.
fn profile_arg(outdir: &Path) -> Result<String, ExtractError> {
    let absolute = outdir
        .canonicalize()
        .map_err(|err| ExtractError::Conversion(format!("failed to resolve scratch directory: {err}")))?;
    let url = Url::from_directory_path(absolute.join("profile")).map_err(|_| {
        ExtractError::Conversion("scratch directory is not a valid file URL".to_string())
    })?;
    Ok(format!("-env:UserInstallation={url}"))
}
