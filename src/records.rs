use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::Display,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Instant,
};

/// Independent partition of records. Ids are only unique within a namespace,
/// so every index keeps one partition per namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Bundled reference data.
    Default,
    /// Foods created by the user.
    User,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Default, Namespace::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Default => "default",
            Namespace::User => "user",
        }
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub kind: Namespace,

    pub name: String,
    pub alt_name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecordCreate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Partial update. `Some("")` clears an optional field.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecordUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Source of truth for food records. The search subsystem only reads
/// through `list`/`get_by_id`; the mutating calls exist for callers that
/// own the write path and re-index afterwards.
pub trait RecordStore: Send + Sync {
    fn list(&self, ns: Namespace) -> anyhow::Result<Vec<Record>>;
    fn get_by_id(&self, ns: Namespace, id: u64) -> anyhow::Result<Option<Record>>;
    fn create(&self, ns: Namespace, create: RecordCreate) -> anyhow::Result<Record>;
    fn update(&self, ns: Namespace, id: u64, update: RecordUpdate) -> anyhow::Result<Record>;
    fn delete(&self, ns: Namespace, id: u64) -> anyhow::Result<()>;
}

const CSV_HEADERS: [&str; 4] = ["id", "name", "alt_name", "notes"];

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// CSV-backed record store, one file per namespace, fully cached in memory.
#[derive(Debug)]
pub struct BackendCsv {
    dir: PathBuf,
    tables: RwLock<HashMap<Namespace, Vec<Record>>>,
}

impl BackendCsv {
    pub fn file_name(ns: Namespace) -> &'static str {
        match ns {
            Namespace::Default => "foods.csv",
            Namespace::User => "user_foods.csv",
        }
    }

    pub fn load(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create record directory {}", dir.display()))?;

        let mut tables = HashMap::new();
        for ns in Namespace::ALL {
            let path = dir.join(Self::file_name(ns));
            tables.insert(ns, Self::read_table(&path, ns)?);
        }

        Ok(BackendCsv {
            dir,
            tables: RwLock::new(tables),
        })
    }

    fn read_table(path: &Path, ns: Namespace) -> anyhow::Result<Vec<Record>> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new record table at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;

        let mut records = vec![];
        for row in csv_reader.records() {
            let row = row?;
            let id = row
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .parse::<u64>()?;
            let name = row
                .get(1)
                .ok_or(anyhow!("couldnt get record name"))?
                .to_string();
            let alt_name = row.get(2).map(|s| s.to_string());
            let notes = row.get(3).map(|s| s.to_string());

            records.push(Record {
                id,
                kind: ns,
                name,
                alt_name: non_empty(alt_name),
                notes: non_empty(notes),
            });
        }

        log::debug!(
            "took {}ms to read {}",
            now.elapsed().as_micros() as f64 / 1000.0,
            path.display()
        );

        Ok(records)
    }

    fn save(&self, ns: Namespace, records: &[Record]) -> anyhow::Result<()> {
        let path = self.dir.join(Self::file_name(ns));
        let temp_path = self.dir.join(format!("{}-tmp", Self::file_name(ns)));

        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for record in records {
            csv_wrt.write_record([
                record.id.to_string().as_str(),
                &record.name,
                record.alt_name.as_deref().unwrap_or_default(),
                record.notes.as_deref().unwrap_or_default(),
            ])?;
        }
        csv_wrt.flush()?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }
}

impl RecordStore for BackendCsv {
    fn list(&self, ns: Namespace) -> anyhow::Result<Vec<Record>> {
        let tables = self
            .tables
            .read()
            .map_err(|e| anyhow!("record table lock poisoned: {e}"))?;
        Ok(tables.get(&ns).cloned().unwrap_or_default())
    }

    fn get_by_id(&self, ns: Namespace, id: u64) -> anyhow::Result<Option<Record>> {
        let tables = self
            .tables
            .read()
            .map_err(|e| anyhow!("record table lock poisoned: {e}"))?;
        Ok(tables
            .get(&ns)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned()))
    }

    fn create(&self, ns: Namespace, create: RecordCreate) -> anyhow::Result<Record> {
        if create.name.trim().is_empty() {
            anyhow::bail!("record name must not be empty");
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|e| anyhow!("record table lock poisoned: {e}"))?;
        let records = tables.entry(ns).or_default();

        let id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let record = Record {
            id,
            kind: ns,
            name: create.name.trim().to_string(),
            alt_name: non_empty(create.alt_name),
            notes: non_empty(create.notes),
        };
        let mut next = records.clone();
        next.push(record.clone());
        self.save(ns, &next)?;
        *records = next;

        Ok(record)
    }

    fn update(&self, ns: Namespace, id: u64, update: RecordUpdate) -> anyhow::Result<Record> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| anyhow!("record table lock poisoned: {e}"))?;
        let records = tables.entry(ns).or_default();

        let pos = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| anyhow!("record {ns}/{id} not found"))?;
        let mut next = records.clone();
        let record = &mut next[pos];

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                anyhow::bail!("record name must not be empty");
            }
            record.name = name.trim().to_string();
        }
        if let Some(alt_name) = update.alt_name {
            record.alt_name = non_empty(Some(alt_name));
        }
        if let Some(notes) = update.notes {
            record.notes = non_empty(Some(notes));
        }

        let updated = record.clone();
        self.save(ns, &next)?;
        *records = next;

        Ok(updated)
    }

    fn delete(&self, ns: Namespace, id: u64) -> anyhow::Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| anyhow!("record table lock poisoned: {e}"))?;
        let records = tables.entry(ns).or_default();

        let next: Vec<Record> = records.iter().filter(|r| r.id != id).cloned().collect();
        if next.len() == records.len() {
            anyhow::bail!("record {ns}/{id} not found");
        }
        self.save(ns, &next)?;
        *records = next;

        Ok(())
    }
}
