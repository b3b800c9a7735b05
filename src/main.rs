use clap::Parser;
use tracing_subscriber::EnvFilter;

use pantry::{
    app::{AppFactory, Pantry},
    cli::{self, Command},
    records::{Record, RecordCreate, RecordUpdate},
    search::{BackfillHandle, BackfillOutcome, SearchError},
};

fn print_records(records: &[Record], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("no records found");
        return Ok(());
    }

    for record in records {
        match &record.alt_name {
            Some(alt_name) => println!("{}/{}\t{} ({alt_name})", record.kind, record.id, record.name),
            None => println!("{}/{}\t{}", record.kind, record.id, record.name),
        }
    }
    Ok(())
}

fn report_backfill(result: Result<BackfillOutcome, SearchError>) {
    match result {
        Ok(BackfillOutcome::Completed(stats)) => {
            for s in stats {
                log::info!(
                    "indexed {}: {} text entries, {} embedded, {} pruned, {} failed",
                    s.namespace,
                    s.text_entries,
                    s.embedded,
                    s.pruned,
                    s.failed
                );
            }
        }
        Ok(BackfillOutcome::AlreadyRunning) => log::info!("indexing already in progress"),
        Err(e) => log::warn!("indexing failed: {e}"),
    }
}

async fn finish_backfill(handle: Option<BackfillHandle>) {
    if let Some(handle) = handle {
        if !handle.is_finished() {
            log::info!("waiting for background indexing to finish");
        }
        report_backfill(handle.join().await);
    }
}

async fn run(pantry: Pantry, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Search {
            query,
            json,
            lexical_only,
        } => {
            let backfill = (pantry.config().indexing.backfill_on_start && !lexical_only)
                .then(|| pantry.start_backfill());

            let query = query.join(" ");
            let hits = pantry.search_hits(&query, lexical_only).await;
            print_records(&pantry.hydrate(&hits), json)?;

            finish_backfill(backfill).await;
            Ok(())
        }

        Command::Index {} => {
            let outcome = pantry.backfill().await;
            if let Err(e) = &outcome {
                anyhow::bail!("indexing failed: {e}");
            }
            report_backfill(outcome);
            Ok(())
        }

        Command::Add {
            name,
            alt_name,
            notes,
            ns,
        } => {
            let create = RecordCreate {
                name,
                alt_name,
                notes,
            };
            let record = pantry.create(ns.namespace(), create).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }

        Command::Update {
            id,
            name,
            alt_name,
            notes,
            ns,
        } => {
            let update = RecordUpdate {
                name,
                alt_name,
                notes,
            };

            if update.name.is_none() && update.alt_name.is_none() && update.notes.is_none() {
                println!("This update request does nothing");
                return Ok(());
            }

            let record = pantry.update(ns.namespace(), id, update).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }

        Command::Delete { id, ns } => {
            let ns = ns.namespace();
            pantry.delete(ns, id)?;
            println!("{ns}/{id} removed");
            Ok(())
        }

        Command::Status { json } => {
            let status = pantry.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            match (&status.model, status.model_status) {
                (Some(model), Some(state)) => println!("model: {model} ({state:?})"),
                _ => println!("model: semantic search disabled"),
            }
            for ns in &status.namespaces {
                println!(
                    "{}: {} records, {} text entries, {} vectors, {} missing",
                    ns.namespace, ns.records, ns.text_entries, ns.vector_entries, ns.missing_vectors
                );
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let paths = AppFactory::get_paths()?;
    let pantry = AppFactory::open(&paths)?;

    run(pantry, args.command).await
}
