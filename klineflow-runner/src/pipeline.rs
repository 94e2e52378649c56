//! Pipeline wiring — builds the collaborators from a [`PipelineConfig`] and
//! runs the extract and load halves.
//!
//! The two halves only meet through storage and the tracking table: a cycle
//! runs extraction for every symbol, then one load run over the whole
//! bucket. Loading runs even when some symbols failed to extract, since it
//! only picks up objects that were fully written.

use crate::config::PipelineConfig;
use crate::coordinator::{LoadCoordinator, LoadError};
use crate::extract::{extract_symbols, ExtractSummary};
use crate::report::LoadReport;
use crate::tracker::LoadTracker;
use crate::warehouse::{LocalWarehouse, WarehouseError};
use anyhow::{bail, Context, Result};
use klineflow_core::{
    BatchWriter, BinanceSource, ExtractionLoop, KlineSource, LocalObjectStore, ObjectStore,
    WatermarkResolver,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Result of one full cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub extract: ExtractSummary,
    pub load: LoadReport,
}

impl CycleReport {
    pub fn all_succeeded(&self) -> bool {
        self.extract.all_succeeded() && self.load.all_succeeded()
    }
}

/// Storage and load state of one symbol, for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolStatus {
    pub symbol: String,
    pub objects: usize,
    pub latest: Option<String>,
    /// Where the next extraction cycle resumes.
    pub watermark_ms: i64,
    /// Objects recorded as loaded; `None` before the first load run.
    pub loaded: Option<usize>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<LocalObjectStore>,
    source: Box<dyn KlineSource>,
    writer: BatchWriter,
    warehouse: Arc<LocalWarehouse>,
}

impl Pipeline {
    /// Wire the pipeline against the Binance REST API.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let source = BinanceSource::with_timeout(
            config.source.base_url.as_str(),
            Duration::from_secs(config.source.timeout_secs),
            config.retry_policy(),
        )
        .context("failed to build HTTP client")?;
        Ok(Self::with_source(config, Box::new(source)))
    }

    /// Wire the pipeline against any kline source.
    pub fn with_source(config: &PipelineConfig, source: Box<dyn KlineSource>) -> Self {
        let store = Arc::new(LocalObjectStore::new(
            config.storage.root.as_path(),
            config.storage.bucket.as_str(),
        ));

        let mut writer = BatchWriter::new(store.clone(), config.codec());
        if let Some(dir) = &config.storage.staging_dir {
            writer = writer.with_staging_dir(dir.as_path());
        }

        let warehouse = Arc::new(
            LocalWarehouse::new(
                config.warehouse.root.as_path(),
                &config.warehouse.project,
                &config.warehouse.dataset,
            )
            .attach_store(store.clone()),
        );

        Self {
            config: config.clone(),
            store,
            source,
            writer,
            warehouse,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalObjectStore> {
        &self.store
    }

    pub fn warehouse(&self) -> &Arc<LocalWarehouse> {
        &self.warehouse
    }

    pub fn extraction_loop(&self) -> ExtractionLoop<'_> {
        ExtractionLoop::new(
            self.source.as_ref(),
            &self.writer,
            self.config.extraction_config(),
        )
    }

    pub fn tracker(&self) -> LoadTracker {
        LoadTracker::new(
            self.warehouse.clone(),
            self.config.warehouse.tracking_table.as_str(),
        )
    }

    pub fn coordinator(&self) -> LoadCoordinator {
        LoadCoordinator::new(self.store.clone(), self.warehouse.clone(), self.tracker())
            .with_codec(self.config.codec())
            .with_table_prefix(self.config.warehouse.table_prefix.as_str())
            .with_workers(self.config.run.load_workers)
    }

    /// Configured symbols, or the requested subset of them.
    pub fn select_symbols(&self, only: &[String]) -> Result<Vec<String>> {
        if only.is_empty() {
            return Ok(self.config.symbols.clone());
        }
        for symbol in only {
            if !self.config.symbols.contains(symbol) {
                bail!("symbol {symbol} is not in the configured symbol list");
            }
        }
        Ok(only.to_vec())
    }

    /// Extract `symbols` (all configured symbols when empty).
    pub fn extract(
        &self,
        symbols: &[String],
        now_ms: i64,
        cancel: Option<&AtomicBool>,
    ) -> Result<ExtractSummary> {
        let symbols = self.select_symbols(symbols)?;
        let extraction = self.extraction_loop();
        extract_symbols(
            &extraction,
            &symbols,
            self.config.run.extract_workers,
            now_ms,
            cancel,
        )
        .context("failed to build extraction worker pool")
    }

    pub fn load(&self, cancel: Option<&AtomicBool>) -> Result<LoadReport, LoadError> {
        self.coordinator().run(&self.config.storage.bucket, cancel)
    }

    /// Extract every requested symbol, then load whatever is new.
    pub fn run_cycle(
        &self,
        symbols: &[String],
        now_ms: i64,
        cancel: Option<&AtomicBool>,
    ) -> Result<CycleReport> {
        let extract = self.extract(symbols, now_ms, cancel)?;
        info!(
            succeeded = extract.succeeded(),
            failed = extract.failed(),
            written = extract.written(),
            "extraction phase finished"
        );

        let load = self.load(cancel).context("load run failed")?;
        Ok(CycleReport { extract, load })
    }

    /// Per-symbol object counts, latest object, watermark and load count.
    pub fn status(&self) -> Result<Vec<SymbolStatus>> {
        let codec = self.config.codec();
        let resolver = WatermarkResolver::new(codec.clone());
        let extraction = self.extraction_loop();

        let loaded_set = match self.tracker().loaded_set() {
            Ok(set) => Some(set),
            Err(WarehouseError::TableNotFound { .. }) => None,
            Err(e) => return Err(e).context("failed to read load tracking table"),
        };

        let mut statuses = Vec::with_capacity(self.config.symbols.len());
        for symbol in &self.config.symbols {
            let listed = self
                .store
                .list_objects(&codec.symbol_prefix(symbol))
                .with_context(|| format!("failed to list objects for {symbol}"))?;
            let own: Vec<&String> = listed
                .iter()
                .filter(|p| codec.decode_for(symbol, p).is_some())
                .collect();

            statuses.push(SymbolStatus {
                symbol: symbol.clone(),
                objects: own.len(),
                latest: resolver.latest(symbol, own.iter().copied()).map(|(p, _)| p),
                watermark_ms: extraction
                    .resolve_watermark(symbol)
                    .with_context(|| format!("failed to resolve watermark for {symbol}"))?,
                loaded: loaded_set
                    .as_ref()
                    .map(|set| own.iter().filter(|p| set.contains(p.as_str())).count()),
            });
        }
        Ok(statuses)
    }
}
