//! OCR engine seam.
//!
//! OCR is optional at runtime. If no engine is available the enrichment
//! stage degrades instead of failing the crawl, so [`OcrEngine`] sits
//! behind a trait and the tesseract binary is probed lazily.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use crate::OcrError;

/// Turns an encoded image into recognised text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError>;
}

/// Engine backed by the `tesseract` command line binary.
pub struct TesseractCli {
    binary: PathBuf,
}

impl TesseractCli {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
        }
    }

    #[must_use]
    pub const fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Checks that the binary runs at all, so callers can degrade up front
    /// instead of on the first citation.
    ///
    /// # Errors
    ///
    /// * [`OcrError::EngineUnavailable`] when the binary is missing or broken
    pub async fn probe(&self) -> Result<(), OcrError> {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| OcrError::EngineUnavailable {
                message: format!("{}: {e}", self.binary.display()),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(OcrError::EngineUnavailable {
                message: format!("{} exited with {status}", self.binary.display()),
            })
        }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OcrError::EngineUnavailable {
                message: format!("{}: {e}", self.binary.display()),
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(image_png).await?;
        }
        drop(child.stdin.take());

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(OcrError::EngineFailed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
