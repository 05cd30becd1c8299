//! Deterministic static-site templates.
//!
//! Renders the fallback site used when generation fails, and completes any
//! manifest with the files every published repository must carry.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use minijinja::{AutoEscape, Environment, context};
use serde::Serialize;
use tracing::{error, warn};

use crate::core::types::{Attachment, FileManifest, RunDescriptor};
use crate::io::attachments::AttachmentFile;

const INDEX_TEMPLATE: &str = include_str!("templates/index.html");
const README_TEMPLATE: &str = include_str!("templates/README.md");
const LICENSE_TEMPLATE: &str = include_str!("templates/LICENSE");
const WORKFLOW_TEMPLATE: &str = include_str!("templates/pages.yml");

pub const INDEX_PATH: &str = "index.html";
pub const README_PATH: &str = "README.md";
pub const LICENSE_PATH: &str = "LICENSE";
pub const WORKFLOW_PATH: &str = ".github/workflows/pages.yml";
pub const TASK_FILE_PATH: &str = "task.json";

/// Inputs shared by every template.
#[derive(Debug, Clone)]
pub struct SiteContext<'a> {
    pub descriptor: &'a RunDescriptor,
    pub owner: &'a str,
    pub pages_url: &'a str,
    pub branch: &'a str,
    /// Materialized attachments; always copied into the published tree.
    pub attachments: &'a [AttachmentFile],
}

/// Request echo written to `task.json`. Never carries the intake secret.
#[derive(Debug, Serialize)]
struct TaskFile<'a> {
    task: &'a str,
    round: u32,
    nonce: &'a str,
    email: &'a str,
    brief: &'a str,
    checks: &'a [String],
    attachments: &'a [Attachment],
    evaluation_url: &'a str,
}

struct SiteRenderer {
    env: Environment<'static>,
}

impl SiteRenderer {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|name| {
            if name.ends_with(".html") {
                AutoEscape::Html
            } else {
                AutoEscape::None
            }
        });
        env.add_template(INDEX_PATH, INDEX_TEMPLATE)
            .context("load index template")?;
        env.add_template(README_PATH, README_TEMPLATE)
            .context("load readme template")?;
        env.add_template(LICENSE_PATH, LICENSE_TEMPLATE)
            .context("load license template")?;
        env.add_template(WORKFLOW_PATH, WORKFLOW_TEMPLATE)
            .context("load workflow template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, site: &SiteContext<'_>) -> Result<String> {
        let request = &site.descriptor.request;
        let template = self.env.get_template(name)?;
        let rendered = template.render(context! {
            task => site.descriptor.task_id,
            round => site.descriptor.round,
            brief => request.brief.trim(),
            checks => request.checks,
            attachments => site.attachments,
            pages_url => site.pages_url,
            branch => site.branch,
            holder => site.owner,
            year => Utc::now().year(),
        })?;
        Ok(rendered)
    }

    fn render_all(&self, site: &SiteContext<'_>) -> Result<FileManifest> {
        let mut manifest = FileManifest::new();
        for name in [INDEX_PATH, README_PATH, LICENSE_PATH, WORKFLOW_PATH] {
            let body = self
                .render(name, site)
                .with_context(|| format!("render {name}"))?;
            manifest.insert(name, body);
        }
        Ok(manifest)
    }
}

/// Deterministic fallback site. Always produces a publishable manifest.
pub fn fallback_manifest(site: &SiteContext<'_>) -> FileManifest {
    let rendered = SiteRenderer::new().and_then(|renderer| renderer.render_all(site));
    let mut manifest = match rendered {
        Ok(manifest) => manifest,
        Err(err) => {
            error!(err = %format!("{err:#}"), "template rendering failed, using minimal page");
            minimal_manifest(site)
        }
    };
    add_attachments(&mut manifest, site);
    write_task_file(&mut manifest, site);
    manifest
}

/// Fill in required files missing from a generated manifest.
///
/// A manifest without `index.html` receives the whole fallback site for any
/// path it lacks. Attachments replace generated files at the same path, and
/// `task.json` is always rewritten from the descriptor.
pub fn complete_manifest(mut manifest: FileManifest, site: &SiteContext<'_>) -> FileManifest {
    let fallback = fallback_manifest(site);
    if !manifest.contains(INDEX_PATH) {
        warn!(
            task_id = %site.descriptor.task_id,
            "generated manifest lacks index.html, supplementing with fallback site"
        );
        for (path, contents) in fallback.iter() {
            manifest.insert_missing(path, contents.clone());
        }
    }
    for path in [LICENSE_PATH, WORKFLOW_PATH, README_PATH] {
        if let Some(contents) = fallback.get(path) {
            manifest.insert_missing(path, contents);
        }
    }
    add_attachments(&mut manifest, site);
    write_task_file(&mut manifest, site);
    manifest
}

fn add_attachments(manifest: &mut FileManifest, site: &SiteContext<'_>) {
    for file in site.attachments {
        manifest.insert(file.path.clone(), file.bytes.clone());
    }
}

fn write_task_file(manifest: &mut FileManifest, site: &SiteContext<'_>) {
    let descriptor = site.descriptor;
    let task_file = TaskFile {
        task: &descriptor.task_id,
        round: descriptor.round,
        nonce: &descriptor.nonce,
        email: &descriptor.email,
        brief: &descriptor.request.brief,
        checks: &descriptor.request.checks,
        attachments: &descriptor.request.attachments,
        evaluation_url: &descriptor.evaluation_url,
    };
    match serde_json::to_string_pretty(&task_file) {
        Ok(mut json) => {
            json.push('\n');
            manifest.insert(TASK_FILE_PATH, json);
        }
        Err(err) => warn!(err = %err, "could not serialize task.json"),
    }
}

fn minimal_manifest(site: &SiteContext<'_>) -> FileManifest {
    let mut manifest = FileManifest::new();
    manifest.insert(
        INDEX_PATH,
        format!(
            "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body><h1>{title}</h1><p>{brief}</p></body></html>\n",
            title = escape_html(&site.descriptor.task_id),
            brief = escape_html(&site.descriptor.request.brief),
        ),
    );
    manifest.insert(
        README_PATH,
        format!("# {}\n\n{}\n", site.descriptor.task_id, site.pages_url),
    );
    manifest
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::core::types::Attachment;
    use crate::test_support::{ManualClock, descriptor};

    fn site<'a>(descriptor: &'a RunDescriptor) -> SiteContext<'a> {
        SiteContext {
            descriptor,
            owner: "octo",
            pages_url: "https://octo.github.io/site/",
            branch: "main",
            attachments: &[],
        }
    }

    #[test]
    fn fallback_contains_required_files() {
        let clock = Arc::new(ManualClock::new());
        let mut desc = descriptor("Captcha", 1, &clock, Duration::from_secs(60));
        desc.request.checks = vec!["Page shows <h1>".to_string()];
        desc.request.attachments = vec![Attachment {
            name: "sample.png".to_string(),
            url: "https://files.test/sample.png".to_string(),
        }];

        let files = [AttachmentFile {
            name: "sample.png".to_string(),
            path: "assets/sample.png".to_string(),
            bytes: b"\x89PNG\r\n\x1a\n".to_vec(),
            fetched: true,
        }];
        let manifest = fallback_manifest(&SiteContext {
            attachments: &files,
            ..site(&desc)
        });
        for path in [INDEX_PATH, README_PATH, LICENSE_PATH, WORKFLOW_PATH, TASK_FILE_PATH] {
            assert!(manifest.contains(path), "missing {path}");
        }

        let index = manifest.get(INDEX_PATH).expect("index");
        assert!(index.contains("Page shows &lt;h1&gt;"));
        assert!(index.contains("download>sample.png</a>"));
        assert_eq!(
            manifest.get_bytes("assets/sample.png"),
            Some(&b"\x89PNG\r\n\x1a\n"[..])
        );
        let license = manifest.get(LICENSE_PATH).expect("license");
        assert!(license.contains("octo"));
        let workflow = manifest.get(WORKFLOW_PATH).expect("workflow");
        assert!(workflow.contains("${{ steps.deployment.outputs.page_url }}"));
    }

    #[test]
    fn task_file_omits_secret_and_echoes_nonce() {
        let clock = Arc::new(ManualClock::new());
        let desc = descriptor("t", 3, &clock, Duration::from_secs(60));
        let manifest = fallback_manifest(&site(&desc));

        let task_json = manifest.get(TASK_FILE_PATH).expect("task.json");
        assert!(task_json.contains(&desc.nonce));
        assert!(!task_json.contains("secret"));
    }

    #[test]
    fn complete_manifest_keeps_generated_files() {
        let clock = Arc::new(ManualClock::new());
        let desc = descriptor("t", 1, &clock, Duration::from_secs(60));
        let mut generated = FileManifest::new();
        generated.insert(INDEX_PATH, "<p>generated</p>");
        generated.insert(README_PATH, "custom readme");

        let completed = complete_manifest(generated, &site(&desc));
        assert_eq!(completed.get(INDEX_PATH), Some("<p>generated</p>"));
        assert_eq!(completed.get(README_PATH), Some("custom readme"));
        assert!(completed.contains(LICENSE_PATH));
        assert!(completed.contains(WORKFLOW_PATH));
        assert!(completed.contains(TASK_FILE_PATH));
    }

    #[test]
    fn attachments_replace_generated_files_at_the_same_path() {
        let clock = Arc::new(ManualClock::new());
        let desc = descriptor("t", 1, &clock, Duration::from_secs(60));
        let mut generated = FileManifest::new();
        generated.insert(INDEX_PATH, "<p>generated</p>");
        generated.insert("assets/data.csv", "made up");
        let files = [AttachmentFile {
            name: "data.csv".to_string(),
            path: "assets/data.csv".to_string(),
            bytes: b"a,b\n1,2\n".to_vec(),
            fetched: true,
        }];

        let completed = complete_manifest(
            generated,
            &SiteContext {
                attachments: &files,
                ..site(&desc)
            },
        );
        assert_eq!(completed.get_bytes("assets/data.csv"), Some(&b"a,b\n1,2\n"[..]));
        assert_eq!(completed.get(INDEX_PATH), Some("<p>generated</p>"));
    }

    #[test]
    fn complete_manifest_supplements_missing_index() {
        let clock = Arc::new(ManualClock::new());
        let desc = descriptor("t", 1, &clock, Duration::from_secs(60));
        let mut generated = FileManifest::new();
        generated.insert("app.js", "console.log(1)");

        let completed = complete_manifest(generated, &site(&desc));
        assert!(completed.contains(INDEX_PATH));
        assert_eq!(completed.get("app.js"), Some("console.log(1)"));
    }
}
