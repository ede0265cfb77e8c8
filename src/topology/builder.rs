//! Builds and spawns the task graph for a loaded configuration.

use std::sync::Arc;

use indexmap::IndexMap;
use snafu::ResultExt;
use tokio::sync::mpsc;

use super::consumer::TableConsumer;
use super::running::{RunningTopology, TaskHandle};
use super::{
    BuildGrammarSnafu, BuildMultilineSnafu, CheckpointSnafu, DeadLetterSnafu, TopologyError,
};
use crate::batcher::Batcher;
use crate::checkpointer::Checkpointer;
use crate::config::schema::TableSchema;
use crate::config::Config;
use crate::dead_letter::DeadLetterSink;
use crate::event::ParsedRow;
use crate::internal_events::SourceSuspended;
use crate::parse::Parser;
use crate::shutdown::ShutdownCoordinator;
use crate::sinks::BatchWriter;
use crate::sources::FileSource;

/// Spawn every source and consumer task for `config`, writing batches
/// through `writer`.
pub async fn start(
    config: &Config,
    writer: Arc<dyn BatchWriter>,
) -> Result<RunningTopology, TopologyError> {
    let checkpointer = Checkpointer::load(&config.data_dir).context(CheckpointSnafu)?;
    let dead_letter = match &config.dead_letter_path {
        Some(path) => Some(Arc::new(
            DeadLetterSink::open(path).await.context(DeadLetterSnafu)?,
        )),
        None => None,
    };
    let schemas: IndexMap<String, Arc<TableSchema>> = config
        .tables
        .iter()
        .map(|(name, schema)| (name.clone(), Arc::new(schema.clone())))
        .collect();

    let coordinator = ShutdownCoordinator::new();
    let mut tasks = Vec::new();

    // One consumer and one queue per destination table in use. The queue is
    // bounded; its capacity is the backpressure window between parse and
    // insert.
    let mut senders: IndexMap<String, mpsc::Sender<ParsedRow>> = IndexMap::new();
    for source_config in &config.sources {
        if senders.contains_key(&source_config.table) {
            continue;
        }
        let table = source_config.table.clone();
        let (tx, rx) = mpsc::channel(config.batch.queue_capacity);
        senders.insert(table.clone(), tx);
        let consumer = TableConsumer::new(
            table.clone(),
            rx,
            Batcher::new(table.clone(), config.batch.clone()),
            Arc::clone(&writer),
            config.request.clone(),
            checkpointer.clone(),
            dead_letter.clone(),
            coordinator.subscribe_force(),
        );
        tasks.push(TaskHandle::spawn(format!("sink:{table}"), async move {
            consumer.run().await.map_err(Into::into)
        }));
    }

    for source_config in &config.sources {
        let schema = Arc::clone(&schemas[&source_config.table]);
        let parser = Parser::build(&source_config.grammars, schema).context(BuildGrammarSnafu {
            id: &source_config.id,
        })?;
        let output = senders[&source_config.table].clone();
        let source = FileSource::new(
            source_config.clone(),
            parser,
            checkpointer.clone(),
            output,
            dead_letter.clone(),
            coordinator.subscribe(),
        )
        .context(BuildMultilineSnafu {
            id: &source_config.id,
        })?;
        let id = source_config.id.clone();
        tasks.push(TaskHandle::spawn(format!("source:{id}"), async move {
            // A stream failure ends only this source; the rest of the
            // pipeline keeps running on its remaining inputs.
            match source.run().await {
                Err(error) if !error.is_fatal() => {
                    emit!(SourceSuspended {
                        source_id: &id,
                        error: &error.to_string(),
                    });
                    Ok(())
                }
                result => result.map_err(Into::into),
            }
        }));
    }
    // Only source tasks may keep a queue open; dropping the build-time
    // senders lets each consumer drain and finish once its sources are done.
    drop(senders);

    info!(
        message = "Pipeline started.",
        sources = %config.sources.len(),
        tables = %config.tables.len(),
    );

    let mut topology = RunningTopology::new(tasks, coordinator, config.drain_deadline);
    topology.mark_running();
    Ok(topology)
}
