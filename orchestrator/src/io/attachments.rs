//! Request attachments materialized under `assets/` of the published site.
//!
//! `data:` URIs are decoded in process. `http(s)` URLs go through an
//! [`AttachmentFetcher`]. An attachment that cannot be obtained is replaced by
//! a `failed-<name>.txt` note so the run still publishes.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::budget::DeadlineBudget;
use crate::core::types::Attachment;
use crate::io::process::{build_command, run_command};

/// Directory attachments are written to, relative to the site root.
pub const ASSETS_DIR: &str = "assets";

/// Upper bound on a single download.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

static DATA_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^data:(?P<meta>[^,]*),(?P<data>.*)$").expect("data URI pattern is valid")
});

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w.\-]+").expect("name pattern is valid"));

/// Downloads the bytes behind an `http(s)` attachment URL.
pub trait AttachmentFetcher: Send + Sync {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

/// Fetcher that runs a command with `{url}` substituted and keeps its stdout,
/// e.g. `["curl", "-fsSL", "{url}"]`.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandFetcher {
    pub fn new(argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            output_limit_bytes,
        }
    }
}

impl AttachmentFetcher for CommandFetcher {
    #[instrument(skip_all, fields(url = url))]
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let cmd = build_command(&self.argv, Some(url))?;
        let output = run_command(cmd, None, timeout, self.output_limit_bytes)?;
        if output.timed_out {
            bail!("download timed out after {timeout:?}");
        }
        if !output.status.success() {
            bail!(
                "fetcher exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            );
        }
        if output.stdout.len() >= self.output_limit_bytes {
            bail!(
                "attachment exceeds the {} byte output limit",
                self.output_limit_bytes
            );
        }
        Ok(output.stdout)
    }
}

/// Stand-in used when no fetcher command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredFetcher;

impl AttachmentFetcher for UnconfiguredFetcher {
    fn fetch(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>> {
        bail!("no fetcher command configured")
    }
}

/// An attachment as it will be published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentFile {
    /// Name given in the request.
    pub name: String,
    /// Site-relative path, under [`ASSETS_DIR`].
    pub path: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// False when `bytes` is the failure note rather than the attachment.
    pub fetched: bool,
}

impl AttachmentFile {
    /// `"<path> (<size> bytes)"`, as handed to the generator.
    pub fn summary(&self) -> String {
        format!("{} ({} bytes)", self.path, self.bytes.len())
    }
}

/// Resolve every attachment. Never fails: an attachment that cannot be
/// decoded or downloaded becomes a failure note. Downloads are bounded by
/// [`FETCH_TIMEOUT`] and by what is left of `budget`.
#[instrument(skip_all, fields(count = attachments.len()))]
pub fn materialize(
    attachments: &[Attachment],
    fetcher: &dyn AttachmentFetcher,
    budget: &DeadlineBudget,
) -> Vec<AttachmentFile> {
    attachments
        .iter()
        .map(|attachment| {
            let safe = safe_attachment_name(&attachment.name);
            match load(attachment, fetcher, budget) {
                Ok(bytes) => {
                    debug!(name = %safe, size = bytes.len(), "attachment ready");
                    AttachmentFile {
                        name: attachment.name.clone(),
                        path: format!("{ASSETS_DIR}/{safe}"),
                        bytes,
                        fetched: true,
                    }
                }
                Err(err) => {
                    warn!(name = %safe, err = %format!("{err:#}"), "attachment unavailable");
                    AttachmentFile {
                        name: attachment.name.clone(),
                        path: format!("{ASSETS_DIR}/failed-{safe}.txt"),
                        bytes: format!(
                            "Attachment {:?} could not be fetched: {err:#}\n",
                            attachment.name
                        )
                        .into_bytes(),
                        fetched: false,
                    }
                }
            }
        })
        .collect()
}

fn load(
    attachment: &Attachment,
    fetcher: &dyn AttachmentFetcher,
    budget: &DeadlineBudget,
) -> Result<Vec<u8>> {
    let url = attachment.url.trim();
    let scheme = url
        .split_once(':')
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "data" => decode_data_uri(url),
        "http" | "https" => {
            if budget.expired() {
                bail!("deadline passed before download");
            }
            fetcher.fetch(url, FETCH_TIMEOUT.min(budget.remaining()))
        }
        _ => bail!("unsupported attachment URL scheme '{scheme}'"),
    }
}

/// Decode a `data:` URI. Base64 payloads are decoded as such; anything else
/// is percent-decoded with `+` read as a space.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let captures = DATA_URI
        .captures(uri)
        .ok_or_else(|| anyhow!("invalid data URI"))?;
    let meta = &captures["meta"];
    let data = &captures["data"];
    let is_base64 = meta
        .split(';')
        .skip(1)
        .any(|param| param.eq_ignore_ascii_case("base64"));
    if is_base64 {
        let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD.decode(compact).context("decode base64 data URI")
    } else {
        percent_decode(data)
    }
}

fn percent_decode(data: &str) -> Result<Vec<u8>> {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| anyhow!("bad percent escape at byte {i}"))?;
                out.push(hex);
                i += 2;
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    Ok(out)
}

/// File name safe to place under [`ASSETS_DIR`]: runs of characters outside
/// `[A-Za-z0-9_.-]` (Unicode word characters included) become `_`.
pub fn safe_attachment_name(name: &str) -> String {
    let sanitized = UNSAFE_NAME_CHARS.replace_all(name.trim(), "_");
    if sanitized.chars().all(|c| c == '.') {
        "attachment".to_string()
    } else {
        sanitized.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::test_support::ManualClock;

    /// 1x1 transparent PNG.
    const PNG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

    #[derive(Default)]
    struct RecordingFetcher {
        calls: Mutex<Vec<(String, Duration)>>,
    }

    impl AttachmentFetcher for RecordingFetcher {
        fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
            self.calls
                .lock()
                .expect("lock")
                .push((url.to_string(), timeout));
            if url.ends_with("missing.csv") {
                bail!("HTTP 404");
            }
            Ok(b"a,b\n1,2\n".to_vec())
        }
    }

    fn budget(window: Duration) -> DeadlineBudget {
        DeadlineBudget::starting_now(Arc::new(ManualClock::new()), window)
    }

    fn attachment(name: &str, url: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn decodes_base64_png() {
        let bytes =
            decode_data_uri(&format!("data:image/png;base64,{PNG_BASE64}")).expect("decode");
        assert!(bytes.starts_with(b"\x89PNG\r\n\x1a\n"));
        assert_eq!(bytes.len(), 68);
    }

    #[test]
    fn decodes_plain_data_uri() {
        let bytes = decode_data_uri("data:text/csv,a%2Cb+c%0A").expect("decode");
        assert_eq!(bytes, b"a,b c\n");
        assert!(decode_data_uri("data:text/plain,%zz").is_err());
        assert!(decode_data_uri("not-a-data-uri").is_err());
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(safe_attachment_name(" my file (1).png "), "my_file_1_.png");
        assert_eq!(safe_attachment_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(safe_attachment_name(""), "attachment");
        assert_eq!(safe_attachment_name(".."), "attachment");
    }

    #[test]
    fn materializes_data_and_remote_attachments() {
        let fetcher = RecordingFetcher::default();
        let files = materialize(
            &[
                attachment("logo.png", &format!("data:image/png;base64,{PNG_BASE64}")),
                attachment("data.csv", "https://files.test/data.csv"),
            ],
            &fetcher,
            &budget(Duration::from_secs(600)),
        );

        assert_eq!(files[0].path, "assets/logo.png");
        assert!(files[0].fetched);
        assert_eq!(files[0].summary(), "assets/logo.png (68 bytes)");
        assert_eq!(files[1].path, "assets/data.csv");
        assert_eq!(files[1].bytes, b"a,b\n1,2\n");

        let calls = fetcher.calls.lock().expect("lock").clone();
        assert_eq!(
            calls,
            vec![("https://files.test/data.csv".to_string(), FETCH_TIMEOUT)]
        );
    }

    #[test]
    fn unavailable_attachments_become_failure_notes() {
        let fetcher = RecordingFetcher::default();
        let files = materialize(
            &[
                attachment("missing.csv", "https://files.test/missing.csv"),
                attachment("broken.png", "data:image/png;base64,@@@"),
                attachment("local", "file:///etc/hosts"),
            ],
            &fetcher,
            &budget(Duration::from_secs(5)),
        );

        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "assets/failed-missing.csv.txt",
                "assets/failed-broken.png.txt",
                "assets/failed-local.txt",
            ]
        );
        assert!(files.iter().all(|f| !f.fetched));
        let note = String::from_utf8(files[0].bytes.clone()).expect("utf8");
        assert!(note.starts_with("Attachment \"missing.csv\" could not be fetched"));
        assert!(note.contains("HTTP 404"));

        // Downloads are capped by the remaining budget.
        let calls = fetcher.calls.lock().expect("lock").clone();
        assert_eq!(calls[0].1, Duration::from_secs(5));
    }

    #[test]
    fn expired_budget_skips_downloads() {
        let fetcher = RecordingFetcher::default();
        let files = materialize(
            &[attachment("data.csv", "https://files.test/data.csv")],
            &fetcher,
            &budget(Duration::ZERO),
        );
        assert!(!files[0].fetched);
        assert!(fetcher.calls.lock().expect("lock").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn command_fetcher_returns_stdout() {
        let argv = |script: &str| vec!["sh".to_string(), "-c".to_string(), script.to_string()];

        let bytes = CommandFetcher::new(argv("printf '%s' '{url}'"), 1024)
            .fetch("https://files.test/a.txt", Duration::from_secs(5))
            .expect("fetch");
        assert_eq!(bytes, b"https://files.test/a.txt");

        let err = CommandFetcher::new(argv("echo 'HTTP 500' >&2; exit 22"), 1024)
            .fetch("https://files.test/a.txt", Duration::from_secs(5))
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));

        let err = CommandFetcher::new(argv("printf 0123456789"), 4)
            .fetch("https://files.test/a.txt", Duration::from_secs(5))
            .unwrap_err();
        assert!(err.to_string().contains("output limit"));
    }
}
