//! Writes rendered configurations and asks the proxy to reload.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use log::{debug, info, warn};
use tokio::process::Command;

use crate::discovery::Service;
use crate::error::{EmitError, EmitResult};
use crate::render::Renderer;

pub struct ConfigEmitter {
    renderer: Box<dyn Renderer>,
    reload_command: Vec<String>,
}

impl ConfigEmitter {
    /// `reload_command` must hold at least the program name.
    pub fn new(renderer: Box<dyn Renderer>, reload_command: Vec<String>) -> Self {
        Self {
            renderer,
            reload_command,
        }
    }

    /// Render `services` into `destination` and trigger a reload.
    ///
    /// If rendering or writing fails the previous file is left in place and
    /// no reload is issued.
    pub fn emit(&self, services: &[Service], destination: &Path) -> EmitResult<()> {
        for service in services {
            info!("{}: {:?}", service.name, service.addresses());
        }

        let rendered = self.renderer.render(services)?;
        write_atomic(destination, rendered.as_bytes())?;
        info!("Wrote new proxy config to {}", destination.display());

        self.reload()
    }

    /// Start the reload command without waiting for it.  The exit status is
    /// only logged.
    pub fn reload(&self) -> EmitResult<()> {
        let command = self.reload_command.join(" ");
        let (program, args) = match self.reload_command.split_first() {
            Some(parts) => parts,
            None => {
                return Err(EmitError::Reload {
                    command,
                    source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
                })
            }
        };
        info!("Reloading proxy...");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| EmitError::Reload {
                command: command.clone(),
                source,
            })?;

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("`{}` finished", command),
                Ok(status) => warn!("`{}` exited with {}", command, status),
                Err(e) => warn!("Failed to wait for `{}`: {}", command, e),
            }
        });
        Ok(())
    }
}

/// Replace `path` with `contents` via a temp file in the same directory, so
/// readers only ever see the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> EmitResult<()> {
    let io_err = |source: std::io::Error| EmitError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(io_err)?;
    }
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Put a fallback configuration in place when nothing has been rendered yet.
/// Returns whether the fallback was installed.
pub fn install_fallback(fallback: &Path, destination: &Path) -> EmitResult<bool> {
    if destination.exists() {
        return Ok(false);
    }
    let contents = std::fs::read(fallback).map_err(|source| EmitError::Io {
        path: fallback.to_path_buf(),
        source,
    })?;
    write_atomic(destination, &contents)?;
    Ok(true)
}
