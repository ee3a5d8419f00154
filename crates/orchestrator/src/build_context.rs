//! Container build context for one artifact
//!
//! A context is the generated `Dockerfile`, the service entry point, and a
//! `requirements.txt` made of the base manifest plus the artifact's own
//! dependencies.

use genapi_common::Artifact;
use std::collections::HashSet;

use crate::error::{OrchestratorError, Result};

/// Packages every generated service needs regardless of its own manifest
pub const BASE_REQUIREMENTS: &[&str] = &[
    "fastapi==0.109.0",
    "uvicorn[standard]==0.27.0",
    "python-multipart==0.0.6",
];

pub const ENTRY_POINT: &str = "main.py";
pub const REQUIREMENTS: &str = "requirements.txt";
pub const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub path: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    files: Vec<ContextFile>,
}

impl BuildContext {
    /// Assemble the context for an artifact
    pub fn for_artifact(artifact: &Artifact, base_image: &str, container_port: u16) -> Result<Self> {
        if artifact.code.is_empty() {
            return Err(OrchestratorError::Artifact("code is empty".to_string()));
        }

        let files = vec![
            ContextFile {
                path: DOCKERFILE.to_string(),
                contents: dockerfile(base_image, container_port).into_bytes(),
            },
            ContextFile {
                path: REQUIREMENTS.to_string(),
                contents: requirements(&artifact.dependencies).into_bytes(),
            },
            ContextFile {
                path: ENTRY_POINT.to_string(),
                contents: artifact.code.clone(),
            },
        ];

        Ok(Self { files })
    }

    pub fn files(&self) -> &[ContextFile] {
        &self.files
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.contents.as_slice())
    }

    /// Uncompressed tar archive as expected by the image build endpoint
    pub fn to_tar(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        for file in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(file.contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, &file.path, file.contents.as_slice())?;
        }

        Ok(builder.into_inner()?)
    }
}

fn dockerfile(base_image: &str, container_port: u16) -> String {
    format!(
        "FROM {base_image}\n\
         WORKDIR /app\n\
         COPY {REQUIREMENTS} .\n\
         RUN pip install --no-cache-dir -r {REQUIREMENTS}\n\
         COPY {ENTRY_POINT} .\n\
         EXPOSE {container_port}\n\
         CMD [\"uvicorn\", \"main:app\", \"--host\", \"0.0.0.0\", \"--port\", \"{container_port}\"]\n"
    )
}

/// Base manifest followed by user dependencies.
///
/// A user pin for a package in the base manifest replaces the base pin.
fn requirements(dependencies: &[String]) -> String {
    let user_packages: HashSet<String> = dependencies.iter().map(|d| package_name(d)).collect();

    let mut out = String::new();
    for base in BASE_REQUIREMENTS {
        if !user_packages.contains(&package_name(base)) {
            out.push_str(base);
            out.push('\n');
        }
    }
    for dep in dependencies {
        out.push_str(dep);
        out.push('\n');
    }
    out
}

/// Normalized distribution name of a requirement line
fn package_name(requirement: &str) -> String {
    let end = requirement
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';' | ' '))
        .unwrap_or(requirement.len());

    requirement[..end].trim().to_ascii_lowercase().replace('_', "-")
}
