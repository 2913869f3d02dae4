//! Embedding oracle: image in, zero or one face embeddings out.
//!
//! Extraction itself happens outside this crate. [`CommandOracle`] talks to an
//! extraction sidecar over stdin/stdout; tests plug in their own oracle.

use crate::types::Embedding;
use image::ImageFormat;
pub use image::RgbImage;
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use thiserror::Error;

// Linear gain/offset applied before extraction (helps underexposed webcams).
const DEFAULT_GAIN: f32 = 1.2;
const DEFAULT_BIAS: f32 = 20.0;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("failed to run extractor `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("extractor i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("extractor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("extractor output is not a JSON list of vectors: {0}")]
    BadOutput(#[from] serde_json::Error),
    #[error("failed to encode image for extractor: {0}")]
    Encode(#[from] image::ImageError),
    #[error("embedding has {got} components, expected {expected}")]
    Dimension { expected: usize, got: usize },
}

/// Source of face embeddings.
///
/// Implementations return an empty list when no face is visible and at most
/// one embedding otherwise; callers only look at the first.
pub trait EmbeddingOracle {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, OracleError>;
}

impl<T: EmbeddingOracle + ?Sized> EmbeddingOracle for Box<T> {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, OracleError> {
        (**self).extract(image)
    }
}

/// Per-channel `saturate(gain * v + bias)` adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    pub gain: f32,
    pub bias: f32,
}

impl Default for Adjustment {
    fn default() -> Self {
        Self {
            gain: DEFAULT_GAIN,
            bias: DEFAULT_BIAS,
        }
    }
}

impl Adjustment {
    pub fn apply(&self, image: &mut RgbImage) {
        for px in image.pixels_mut() {
            for c in px.0.iter_mut() {
                *c = (self.gain * f32::from(*c) + self.bias)
                    .abs()
                    .round()
                    .clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Decode an uploaded image (any format the `image` crate recognises) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Oracle backed by an external extraction command.
///
/// The command receives the image as PNG on stdin and prints a JSON array of
/// embeddings on stdout, e.g. `[]` or `[[0.01, -0.2, ...]]`.
pub struct CommandOracle {
    program: String,
    args: Vec<String>,
}

impl CommandOracle {
    /// Build from a whitespace-separated command line. Returns `None` if empty.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl EmbeddingOracle for CommandOracle {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, OracleError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OracleError::Spawn {
                command: self.command_line(),
                source,
            })?;

        // Feed stdin from its own thread so the child is always reaped, even
        // when it exits without reading the whole image.
        let stdin = child.stdin.take();
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&png)?;
            }
            Ok(())
        });
        let output = child.wait_with_output()?;
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));

        if !output.status.success() {
            return Err(OracleError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        written?;

        let vectors: Vec<Vec<f64>> = serde_json::from_slice(&output.stdout)?;
        tracing::debug!(faces = vectors.len(), "extractor returned");
        Ok(vectors.into_iter().take(1).map(Embedding::new).collect())
    }
}
