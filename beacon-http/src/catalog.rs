//! Detectable-applications catalog.
//!
//! The catalog endpoint serves one JSON array of application descriptors,
//! tens of megabytes of it. The download path therefore never buffers the
//! whole document: descriptors are decoded one at a time out of a growable
//! byte buffer fed by the response stream, reduced to the fields lookup
//! needs, and appended to a line-delimited file. The file name carries the
//! validator (`ETag`) and the save time, so later runs can revalidate with a
//! conditional GET and skip downloads inside the refresh window.

use crate::{HttpError, RestClient};
use futures_util::StreamExt;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Operating-system codes used in catalog entries.
pub const OS_LINUX: u8 = 0;
pub const OS_WINDOWS: u8 = 1;
pub const OS_MACOS: u8 = 2;

const FILE_PREFIX: &str = "detectable_apps_";
const FILE_SUFFIX: &str = ".ndjson";

/// An on-disk catalog file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFile {
    pub path: PathBuf,
    pub etag: String,
    /// Save time in epoch seconds (coarse; the file name stores it /1000).
    pub save_time_secs: u64,
}

/// Result of a conditional catalog download.
#[derive(Debug)]
pub enum CatalogFetch {
    /// A fresh catalog was written.
    Downloaded(CatalogFile),
    /// The server's copy matches the validator; the existing file stands.
    NotModified,
}

/// A successful lookup of a process path against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogHit {
    pub app_id: String,
    pub app_name: String,
    /// Matched executable suffix, without the leading slash.
    pub exe_path: String,
}

/// One descriptor as served by the catalog endpoint.
#[derive(Debug, Deserialize)]
struct RawDescriptor {
    id: String,
    name: String,
    #[serde(default)]
    executables: Vec<RawExecutable>,
}

#[derive(Debug, Deserialize)]
struct RawExecutable {
    os: String,
    name: String,
}

/// Persisted catalog store rooted at the configuration directory.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    dir: PathBuf,
}

impl CatalogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Locate the current catalog file, if any.
    pub fn existing(&self) -> Option<CatalogFile> {
        let entries = fs::read_dir(&self.dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(file) = parse_file_name(&path) {
                return Some(file);
            }
        }
        None
    }

    /// Whether the catalog should be re-downloaded. A zero-day delay means
    /// always.
    pub fn needs_refresh(&self, download_delay_days: u64) -> bool {
        if download_delay_days == 0 {
            return true;
        }
        match self.existing() {
            None => true,
            Some(file) => {
                now_secs().saturating_sub(file.save_time_secs) > download_delay_days * 86_400
            }
        }
    }

    /// Download the catalog, revalidating with `etag` when one is known.
    ///
    /// On 200 the body is stream-parsed and persisted; on 304 the existing
    /// file is left in place. A mid-stream parse failure abandons the refresh
    /// and keeps the prior file.
    pub async fn download(
        &self,
        rest: &RestClient,
        etag: Option<&str>,
    ) -> Result<CatalogFetch, HttpError> {
        let mut request = rest.http().get(rest.api_url("/applications/detectable"));
        if let Some(etag) = etag {
            request = request.header("If-None-Match", format!("W/\"{etag}\""));
        }
        let response = request.send().await?;

        match response.status().as_u16() {
            304 => {
                debug!("detectable applications catalog not modified");
                Ok(CatalogFetch::NotModified)
            }
            200 => {
                let new_etag = response
                    .headers()
                    .get("etag")
                    .and_then(|value| value.to_str().ok())
                    .map(strip_weak_validator)
                    .unwrap_or_default()
                    .to_string();

                let tmp_path = self.dir.join(".detectable_apps.tmp");
                let written = self.stream_to_file(response, &tmp_path).await;
                match written {
                    Ok(count) => {
                        let save_time_secs = now_secs();
                        let final_path = self.dir.join(format!(
                            "{FILE_PREFIX}{new_etag}_{}{FILE_SUFFIX}",
                            save_time_secs / 1000
                        ));
                        // Delete-then-rename keeps at most one catalog file.
                        if let Some(old) = self.existing() {
                            let _ = fs::remove_file(&old.path);
                        }
                        fs::rename(&tmp_path, &final_path)?;
                        info!(entries = count, etag = %new_etag, "downloaded detectable applications catalog");
                        Ok(CatalogFetch::Downloaded(CatalogFile {
                            path: final_path,
                            etag: new_etag,
                            save_time_secs,
                        }))
                    }
                    Err(e) => {
                        warn!(error = %e, "catalog refresh abandoned, keeping prior file");
                        let _ = fs::remove_file(&tmp_path);
                        Err(e)
                    }
                }
            }
            status => Err(HttpError::Status { status }),
        }
    }

    /// Incrementally decode the response body and write kept entries as one
    /// JSON array per line.
    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        tmp_path: &Path,
    ) -> Result<u64, HttpError> {
        fs::create_dir_all(&self.dir)?;
        let mut writer = BufWriter::new(File::create(tmp_path)?);
        let mut stream = response.bytes_stream();

        let mut buf: Vec<u8> = Vec::with_capacity(128 * 1024);
        let mut pos = 0usize;
        let mut in_array = false;
        let mut done = false;
        let mut count = 0u64;

        'outer: while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);

            loop {
                while pos < buf.len() && (buf[pos].is_ascii_whitespace() || buf[pos] == b',') {
                    pos += 1;
                }
                if pos >= buf.len() {
                    break;
                }
                if !in_array {
                    if buf[pos] != b'[' {
                        return Err(HttpError::Decode(
                            "catalog body does not start with an array".to_string(),
                        ));
                    }
                    in_array = true;
                    pos += 1;
                    continue;
                }
                if buf[pos] == b']' {
                    done = true;
                    break 'outer;
                }

                let mut iter =
                    serde_json::Deserializer::from_slice(&buf[pos..]).into_iter::<RawDescriptor>();
                match iter.next() {
                    Some(Ok(descriptor)) => {
                        pos += iter.byte_offset();
                        if let Some(line) = reduce_descriptor(&descriptor) {
                            writer.write_all(line.as_bytes())?;
                            writer.write_all(b"\n")?;
                            count += 1;
                        }
                    }
                    // Value split across chunks; read more.
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => return Err(HttpError::Json(e)),
                    None => break,
                }
            }

            // Drop the consumed prefix so the buffer stays bounded by one
            // pending value plus one chunk.
            if pos > 64 * 1024 {
                buf.drain(..pos);
                pos = 0;
            }
        }

        if !done {
            return Err(HttpError::Decode("catalog body ended early".to_string()));
        }
        writer.flush()?;
        Ok(count)
    }

    /// Scan the catalog file for the first entry matching a process path.
    ///
    /// Under Linux both Linux and Windows executables are eligible (Windows
    /// binaries run under Wine); Windows and macOS match only themselves.
    pub fn find_app(
        process_path: &str,
        catalog_path: &Path,
        my_os: u8,
    ) -> Option<CatalogHit> {
        let process_path = process_path.to_lowercase();
        let reader = BufReader::new(File::open(catalog_path).ok()?);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let Ok((app_id, app_name, executables)) =
                serde_json::from_str::<(String, String, Vec<(u8, String)>)>(&line)
            else {
                continue;
            };
            for (exe_os, suffix) in executables {
                if suffix.is_empty() || !os_eligible(my_os, exe_os) {
                    continue;
                }
                if process_path.contains(&suffix) {
                    return Some(CatalogHit {
                        app_id,
                        app_name,
                        exe_path: suffix.trim_start_matches('/').to_string(),
                    });
                }
            }
        }
        None
    }
}

/// Whether a catalog entry for `entry_os` can match on `my_os`.
pub fn os_eligible(my_os: u8, entry_os: u8) -> bool {
    match my_os {
        OS_LINUX => entry_os == OS_LINUX || entry_os == OS_WINDOWS,
        OS_WINDOWS => entry_os == OS_WINDOWS,
        OS_MACOS => entry_os == OS_MACOS,
        _ => false,
    }
}

/// Reduce a raw descriptor to the persisted `[id, name, [[os, path], ...]]`
/// line, or drop it when no executable survives.
fn reduce_descriptor(descriptor: &RawDescriptor) -> Option<String> {
    let executables: Vec<(u8, String)> = descriptor
        .executables
        .iter()
        .filter_map(|exe| {
            let os = match exe.os.as_str() {
                "linux" => OS_LINUX,
                "win32" => OS_WINDOWS,
                "darwin" => OS_MACOS,
                _ => return None,
            };
            let mut path = exe.name.to_lowercase();
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
            Some((os, path))
        })
        .collect();
    if executables.is_empty() {
        return None;
    }
    serde_json::to_string(&(&descriptor.id, &descriptor.name, executables)).ok()
}

fn parse_file_name(path: &Path) -> Option<CatalogFile> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (etag, stamp) = stem.rsplit_once('_')?;
    let save_time_secs = stamp.parse::<u64>().ok()? * 1000;
    Some(CatalogFile {
        path: path.to_path_buf(),
        etag: etag.to_string(),
        save_time_secs,
    })
}

fn strip_weak_validator(raw: &str) -> &str {
    raw.trim_start_matches("W/").trim_matches('"')
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RestClient;
    use proptest::prelude::*;

    fn client_for(server: &mockito::Server) -> RestClient {
        RestClient::new("tok", Some(&server.url()), None, None, None).unwrap()
    }

    const CATALOG_BODY: &str = r#"[
        {"id": "123", "name": "Foo", "aliases": [], "executables": [
            {"os": "win32", "name": "Foo.exe", "is_launcher": false},
            {"os": "darwin", "name": "foo.app"}
        ]},
        {"id": "456", "name": "NoExe", "executables": []},
        {"id": "789", "name": "Bar", "executables": [
            {"os": "linux", "name": "bar/bar.x86_64"}
        ]}
    ]"#;

    #[tokio::test]
    async fn test_download_writes_ndjson() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v9/applications/detectable")
            .with_header("etag", "W/\"abc123\"")
            .with_body(CATALOG_BODY)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path());
        let fetch = store.download(&client_for(&server), None).await.unwrap();

        let CatalogFetch::Downloaded(file) = fetch else {
            panic!("expected a download");
        };
        assert_eq!(file.etag, "abc123");

        let contents = fs::read_to_string(&file.path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        // The descriptor with no surviving executables is dropped.
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"["123","Foo",[[1,"/foo.exe"],[2,"/foo.app"]]]"#);
        assert_eq!(lines[1], r#"["789","Bar",[[0,"/bar/bar.x86_64"]]]"#);

        // The store now reports the file and honors the refresh window.
        assert_eq!(store.existing().unwrap().etag, "abc123");
        assert!(!store.needs_refresh(7));
        assert!(store.needs_refresh(0));
    }

    #[tokio::test]
    async fn test_not_modified_keeps_existing_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v9/applications/detectable")
            .match_header("if-none-match", "W/\"abc123\"")
            .with_status(304)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detectable_apps_abc123_1700000.ndjson");
        fs::write(&path, "[\"1\",\"x\",[[0,\"/x\"]]]\n").unwrap();

        let store = CatalogStore::new(dir.path());
        let fetch = store
            .download(&client_for(&server), Some("abc123"))
            .await
            .unwrap();
        assert!(matches!(fetch, CatalogFetch::NotModified));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_new_download_replaces_old_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v9/applications/detectable")
            .with_header("etag", "W/\"new\"")
            .with_body(r#"[{"id":"1","name":"X","executables":[{"os":"linux","name":"x"}]}]"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("detectable_apps_old_1.ndjson");
        fs::write(&old, "stale\n").unwrap();

        let store = CatalogStore::new(dir.path());
        store.download(&client_for(&server), None).await.unwrap();
        assert!(!old.exists());
        assert_eq!(store.existing().unwrap().etag, "new");
    }

    #[tokio::test]
    async fn test_truncated_body_abandons_refresh() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v9/applications/detectable")
            .with_header("etag", "W/\"bad\"")
            .with_body(r#"[{"id":"1","name":"X","executables":[{"os":"linux","name":"x"}]}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path());
        assert!(store.download(&client_for(&server), None).await.is_err());
        assert!(store.existing().is_none());
    }

    #[test]
    fn test_parse_file_name() {
        let file = parse_file_name(Path::new("/cfg/detectable_apps_abc_1700000.ndjson")).unwrap();
        assert_eq!(file.etag, "abc");
        assert_eq!(file.save_time_secs, 1_700_000_000);
        assert!(parse_file_name(Path::new("/cfg/other.ndjson")).is_none());
    }

    #[test]
    fn test_find_app_wine_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detectable_apps_e_1.ndjson");
        fs::write(&path, "[\"123\",\"Foo\",[[1,\"/foo.exe\"]]]\n").unwrap();

        // A Windows executable matches under Linux (Wine)...
        let hit = CatalogStore::find_app("/home/u/games/foo/foo.exe", &path, OS_LINUX).unwrap();
        assert_eq!(hit.app_id, "123");
        assert_eq!(hit.exe_path, "foo.exe");
        // ...and under Windows, but never under macOS.
        assert!(CatalogStore::find_app("c:/games/foo/foo.exe", &path, OS_WINDOWS).is_some());
        assert!(CatalogStore::find_app("/games/foo/foo.exe", &path, OS_MACOS).is_none());
    }

    #[test]
    fn test_find_app_first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detectable_apps_e_1.ndjson");
        fs::write(
            &path,
            "[\"1\",\"First\",[[0,\"/game\"]]]\n[\"2\",\"Second\",[[0,\"/game\"]]]\n",
        )
        .unwrap();
        let hit = CatalogStore::find_app("/opt/game", &path, OS_LINUX).unwrap();
        assert_eq!(hit.app_id, "1");
    }

    proptest! {
        #[test]
        fn prop_os_eligibility(my_os in 0u8..3, entry_os in 0u8..3) {
            let eligible = os_eligible(my_os, entry_os);
            match my_os {
                OS_WINDOWS => prop_assert_eq!(eligible, entry_os == OS_WINDOWS),
                OS_MACOS => prop_assert_eq!(eligible, entry_os == OS_MACOS),
                OS_LINUX => prop_assert_eq!(eligible, entry_os != OS_MACOS),
                _ => unreachable!(),
            }
        }
    }
}
