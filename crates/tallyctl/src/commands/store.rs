use std::io::Write;
use std::path::Path;

use tally_core::Lifetime;
use tally_state::{StateStore, StoredRecord, STORE_FILE_NAME};
use tracing::info;

/// Open the existing store in `data_dir`. Unlike engine start-up this never
/// creates or replaces a file.
fn open(data_dir: &Path) -> anyhow::Result<StateStore> {
    let path = data_dir.join(STORE_FILE_NAME);
    if !path.is_file() {
        anyhow::bail!("no state store at {}", path.display());
    }
    Ok(StateStore::open(&path)?)
}

fn records(store: &StateStore, scope: Option<Lifetime>) -> anyhow::Result<Vec<StoredRecord>> {
    Ok(match scope {
        Some(lifetime) => store.load_scope(lifetime)?,
        None => store.load()?,
    })
}

pub fn dump(data_dir: &Path, scope: Option<Lifetime>) -> anyhow::Result<()> {
    let store = open(data_dir)?;
    write_records(&mut std::io::stdout().lock(), &records(&store, scope)?)
}

pub fn write_records(out: &mut impl Write, records: &[StoredRecord]) -> anyhow::Result<()> {
    for record in records {
        writeln!(out, "{}", serde_json::to_string(record)?)?;
    }
    Ok(())
}

pub fn wipe(data_dir: &Path, scope: Option<Lifetime>) -> anyhow::Result<()> {
    let store = open(data_dir)?;
    let removed = match scope {
        Some(lifetime) => store.wipe(lifetime)?,
        None => store.wipe_all()?,
    };
    info!(removed, scope = ?scope, "state wiped");
    println!("removed {removed} record(s)");
    Ok(())
}
