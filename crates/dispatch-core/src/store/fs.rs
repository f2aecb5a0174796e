//! Store sobre sistema de archivos, un directorio por registro:
//!
//! ```text
//! <root>/<job_id>/dispatch.claim
//! <root>/<job_id>/<session_id>/meta.json
//!                              parameters.json
//!                              status.json
//!                              output.json
//!                              output_log/<written_at>.json
//!                              progress.jsonl
//!                              history/<channel>.jsonl
//! ```
//!
//! El directorio del JobID es el índice secundario; no se descubre nada por
//! coincidencia de patrones en nombres. Los documentos se escriben en un
//! temporal y se renombran; los logs `.jsonl` sólo crecen.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{holder_is_released, DispatchClaim, JobStore};
use crate::errors::{DispatchError, DispatchResult};
use crate::model::{JobId, NotificationEvent, OutputSnapshot, ProgressEntry, RecordKey, RecordMeta, RequestParameters,
                   SessionId, StatusDocument};

const META: &str = "meta.json";
const PARAMETERS: &str = "parameters.json";
const STATUS: &str = "status.json";
const OUTPUT: &str = "output.json";
const OUTPUT_LOG: &str = "output_log";
const PROGRESS: &str = "progress.jsonl";
const HISTORY: &str = "history";
const CLAIM: &str = "dispatch.claim";

#[derive(Debug, Clone)]
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub fn open(root: impl Into<PathBuf>) -> DispatchResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    fn record_dir(&self, key: &RecordKey) -> PathBuf {
        self.job_dir(&key.job_id).join(key.session_id.as_str())
    }

    /// Directorio del registro, o `NoRecordFound` si no existe.
    fn existing_dir(&self, key: &RecordKey) -> DispatchResult<PathBuf> {
        let dir = self.record_dir(key);
        if dir.join(META).is_file() {
            Ok(dir)
        } else {
            Err(DispatchError::NoRecordFound { job_id: key.job_id.to_string() })
        }
    }

    fn history_file(&self, key: &RecordKey, channel: &str) -> DispatchResult<PathBuf> {
        validate_channel(channel)?;
        Ok(self.existing_dir(key)?.join(HISTORY).join(format!("{channel}.jsonl")))
    }
}

fn validate_channel(channel: &str) -> DispatchResult<()> {
    let ok = !channel.is_empty() && channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DispatchError::RequestNotUnderstood(format!("invalid channel name '{channel}'")))
    }
}

/// Escritura atómica: temporal en el mismo directorio + rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> DispatchResult<()> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| DispatchError::Storage(format!("serialize {}: {e}", path.display())))?;
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&body)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path, key: &RecordKey) -> DispatchResult<T> {
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw).map_err(|e| DispatchError::consistency(key.to_string(), format!("unreadable {}: {e}", path.display())))
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> DispatchResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(value).map_err(|e| DispatchError::Storage(format!("serialize line: {e}")))?;
    line.push(b'\n');
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    // una sola escritura por línea: appends concurrentes no se intercalan
    f.write_all(&line)?;
    Ok(())
}

fn read_lines<T: DeserializeOwned>(path: &Path, key: &RecordKey) -> DispatchResult<Vec<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    raw.lines()
       .filter(|l| !l.trim().is_empty())
       .map(|l| {
           serde_json::from_str(l).map_err(|e| DispatchError::consistency(key.to_string(), format!("corrupt line in {}: {e}", path.display())))
       })
       .collect()
}

impl JobStore for FileJobStore {
    fn create(&self, meta: &RecordMeta, initial: &StatusDocument) -> DispatchResult<()> {
        let dir = self.record_dir(&meta.key);
        fs::create_dir_all(self.job_dir(&meta.key.job_id))?;
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DispatchError::AlreadyExists(meta.key.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        // status antes que meta: meta marca el registro como existente
        write_json_atomic(&dir.join(STATUS), initial)?;
        write_json_atomic(&dir.join(META), meta)?;
        debug!("create key={} dir={}", meta.key, dir.display());
        Ok(())
    }

    fn read_meta(&self, key: &RecordKey) -> DispatchResult<RecordMeta> {
        let dir = self.existing_dir(key)?;
        read_json(&dir.join(META), key)
    }

    fn write_meta(&self, meta: &RecordMeta) -> DispatchResult<()> {
        let dir = self.existing_dir(&meta.key)?;
        write_json_atomic(&dir.join(META), meta)
    }

    fn write_parameters(&self, key: &RecordKey, params: &RequestParameters) -> DispatchResult<()> {
        let dir = self.existing_dir(key)?;
        write_json_atomic(&dir.join(PARAMETERS), params)
    }

    fn read_parameters(&self, key: &RecordKey) -> DispatchResult<RequestParameters> {
        let path = self.existing_dir(key)?.join(PARAMETERS);
        if !path.is_file() {
            return Err(DispatchError::consistency(key.to_string(), "record has no parameters snapshot"));
        }
        read_json(&path, key)
    }

    fn write_status(&self, key: &RecordKey, doc: &StatusDocument) -> DispatchResult<()> {
        let dir = self.existing_dir(key)?;
        write_json_atomic(&dir.join(STATUS), doc)
    }

    fn read_status(&self, key: &RecordKey) -> DispatchResult<StatusDocument> {
        let dir = self.existing_dir(key)?;
        read_json(&dir.join(STATUS), key)
    }

    fn write_output(&self, key: &RecordKey, snapshot: &OutputSnapshot) -> DispatchResult<()> {
        let dir = self.existing_dir(key)?;
        let current = dir.join(OUTPUT);
        if current.is_file() {
            let log_dir = dir.join(OUTPUT_LOG);
            fs::create_dir_all(&log_dir)?;
            let name = match fs::read(&current).ok().and_then(|raw| serde_json::from_slice::<OutputSnapshot>(&raw).ok()) {
                Some(prev) => prev.written_at.format("%Y%m%dT%H%M%S%.9fZ").to_string(),
                None => {
                    warn!("write_output: rotating unreadable output key={key}");
                    format!("unreadable-{}", Uuid::new_v4().simple())
                }
            };
            fs::rename(&current, log_dir.join(format!("{name}.json")))?;
        }
        write_json_atomic(&current, snapshot)
    }

    fn read_output(&self, key: &RecordKey) -> DispatchResult<Option<OutputSnapshot>> {
        let path = self.existing_dir(key)?.join(OUTPUT);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map(Some)
                                    .map_err(|e| DispatchError::OutputCorrupt(format!("{key}: {e}")))
    }

    fn list_output_log(&self, key: &RecordKey) -> DispatchResult<Vec<OutputSnapshot>> {
        let log_dir = self.existing_dir(key)?.join(OUTPUT_LOG);
        let mut paths: Vec<PathBuf> = match fs::read_dir(&log_dir) {
            Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        paths.sort();
        let mut out = Vec::with_capacity(paths.len());
        for p in paths {
            match fs::read(&p).ok().and_then(|raw| serde_json::from_slice(&raw).ok()) {
                Some(snapshot) => out.push(snapshot),
                None => warn!("list_output_log: skipping unreadable {}", p.display()),
            }
        }
        Ok(out)
    }

    fn append_progress(&self, key: &RecordKey, entry: &ProgressEntry) -> DispatchResult<()> {
        let dir = self.existing_dir(key)?;
        append_line(&dir.join(PROGRESS), entry)
    }

    fn list_progress(&self, key: &RecordKey) -> DispatchResult<Vec<ProgressEntry>> {
        let dir = self.existing_dir(key)?;
        read_lines(&dir.join(PROGRESS), key)
    }

    fn append_history(&self, key: &RecordKey, channel: &str, event: &NotificationEvent) -> DispatchResult<()> {
        append_line(&self.history_file(key, channel)?, event)
    }

    fn list_history_events(&self, key: &RecordKey, channel: &str) -> DispatchResult<Vec<NotificationEvent>> {
        read_lines(&self.history_file(key, channel)?, key)
    }

    fn records_for_job(&self, job_id: &JobId) -> DispatchResult<Vec<RecordKey>> {
        let dir = self.job_dir(job_id);
        let entries = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut keys = vec![];
        for entry in entries {
            let entry = entry?;
            if !entry.path().join(META).is_file() {
                continue;
            }
            if let Some(session) = entry.file_name().to_str().and_then(|s| SessionId::parse(s).ok()) {
                keys.push(RecordKey::new(session, job_id.clone()));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn list_keys(&self) -> DispatchResult<Vec<RecordKey>> {
        let mut keys = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // directorios ajenos (p. ej. spool/outbox) no son JobIDs válidos
            if let Some(job_id) = entry.file_name().to_str().and_then(|s| JobId::parse(s).ok()) {
                keys.extend(self.records_for_job(&job_id)?);
            }
        }
        Ok(keys)
    }

    fn claim_dispatch(&self, key: &RecordKey) -> DispatchResult<DispatchClaim> {
        let job_dir = self.job_dir(&key.job_id);
        fs::create_dir_all(&job_dir)?;
        let path = job_dir.join(CLAIM);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let body = serde_json::to_vec(key).map_err(|e| DispatchError::Storage(format!("serialize claim: {e}")))?;
                f.write_all(&body)?;
                return Ok(DispatchClaim::Granted);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        let holder: Option<RecordKey> = fs::read(&path).ok().and_then(|raw| serde_json::from_slice(&raw).ok());
        match holder {
            Some(h) if h == *key => Ok(DispatchClaim::Granted),
            Some(h) if !holder_is_released(self, &h) => Ok(DispatchClaim::Held(h)),
            // titular asentado, desaparecido o claim a medio escribir: se toma
            _ => {
                write_json_atomic(&path, key)?;
                Ok(DispatchClaim::Granted)
            }
        }
    }

    fn release_dispatch(&self, key: &RecordKey) -> DispatchResult<()> {
        let path = self.job_dir(&key.job_id).join(CLAIM);
        let holder: Option<RecordKey> = fs::read(&path).ok().and_then(|raw| serde_json::from_slice(&raw).ok());
        if holder.as_ref() == Some(key) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn file_store_satisfies_contract() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileJobStore::open(dir.path()).unwrap();
        contract::run_all(&store);
    }

    #[test]
    fn torn_output_reads_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileJobStore::open(dir.path()).unwrap();
        let k = contract::key("s1", "0000000000000123");
        contract::create(&store, &k);
        fs::write(store.record_dir(&k).join(OUTPUT), b"{\"written_at\": \"2024-").unwrap();
        assert!(matches!(store.read_output(&k), Err(DispatchError::OutputCorrupt(_))));
        // la siguiente escritura rota el fragmento y deja un output legible
        let snap = OutputSnapshot { written_at: Utc::now(),
                                    output: json!({"ok": true}) };
        store.write_output(&k, &snap).unwrap();
        assert_eq!(store.read_output(&k).unwrap(), Some(snap));
    }

    #[test]
    fn layout_is_keyed_by_job_then_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileJobStore::open(dir.path()).unwrap();
        let k = contract::key("sess01", "00000000000000ab");
        contract::create(&store, &k);
        assert!(dir.path().join("00000000000000ab").join("sess01").join(META).is_file());
        // directorios que no son JobIDs se ignoran al listar
        fs::create_dir_all(dir.path().join("spool")).unwrap();
        assert_eq!(store.list_keys().unwrap(), vec![k]);
    }

    #[test]
    fn channel_names_cannot_escape_record_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileJobStore::open(dir.path()).unwrap();
        let k = contract::key("s1", "0000000000000456");
        contract::create(&store, &k);
        assert!(matches!(store.list_history_events(&k, "../meta"),
                         Err(DispatchError::RequestNotUnderstood(_))));
    }
}
