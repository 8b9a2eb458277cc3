//! The batch lookup.
//!
//! A [`SymbolicationRequest`] holds jobs of stacks whose frames point into modules. All distinct
//! modules referenced by any frame are resolved concurrently through the [`SymCacheActor`] first,
//! then every frame is looked up in the table of its module. A module that cannot be resolved is
//! reported as not found, it never fails the batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::Context;
use symlookup_sources::{ModuleKey, SourceResolver};

use crate::caching::{CacheKey, SymbolStore};
use crate::config::Config;
use crate::convert::{Converter, SymCacheParser};
use crate::download::DownloadService;
use crate::symcaches::{SymCacheActor, SymCacheFetch};
use crate::utils::defer::defer;
use crate::utils::hex::HexValue;

mod interface;

pub use interface::*;

/// A job whose module references have been validated.
struct Job {
    modules: Vec<ModuleKey>,
    stacks: Vec<Vec<RawFrame>>,
}

impl Job {
    fn validate(index: usize, job: SymbolicationJob) -> Result<Self, SymbolicationError> {
        let modules = job
            .memory_map
            .iter()
            .map(|(debug_filename, debug_id)| ModuleKey::new(debug_filename, debug_id))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| SymbolicationError::InvalidRequest(format!("job {index}: {err}")))?;

        for frame in job.stacks.iter().flatten() {
            let RawFrame(module_index, _) = *frame;
            let valid = module_index == RawFrame::NO_MODULE
                || usize::try_from(module_index).is_ok_and(|i| i < modules.len());
            if !valid {
                return Err(SymbolicationError::InvalidRequest(format!(
                    "job {index}: module index {module_index} out of range"
                )));
            }
        }

        Ok(Self {
            modules,
            stacks: job.stacks,
        })
    }

    fn module_of(&self, frame: &RawFrame) -> Option<&ModuleKey> {
        usize::try_from(frame.0)
            .ok()
            .and_then(|i| self.modules.get(i))
    }

    /// The modules referenced by at least one frame.
    fn referenced_modules(&self) -> HashSet<&ModuleKey> {
        self.stacks
            .iter()
            .flatten()
            .filter_map(|frame| self.module_of(frame))
            .collect()
    }
}

/// Resolves modules and symbolicates batches of stacks.
#[derive(Clone, Debug)]
pub struct SymbolicationService {
    symcaches: SymCacheActor,
    max_concurrent_requests: Option<usize>,
    current_requests: Arc<AtomicUsize>,
}

impl SymbolicationService {
    /// Creates the service with the production SymCache converter.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_converter(config, Converter::new(SymCacheParser))
    }

    /// Creates the service with a custom converter.
    pub fn with_converter(config: &Config, converter: Converter) -> anyhow::Result<Self> {
        let cache_dir = config.require_cache_dir()?;
        let store = SymbolStore::open(cache_dir, config.caches)
            .with_context(|| format!("failed to open symbol cache in {}", cache_dir.display()))?;
        let downloader = DownloadService::new(config).context("failed to create http client")?;
        let resolver = SourceResolver::new(config.sources.clone());

        let symcaches = SymCacheActor::new(Arc::new(store), resolver, downloader, converter);
        Ok(Self {
            symcaches,
            max_concurrent_requests: config.max_concurrent_requests,
            current_requests: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Symbolicates all jobs of a request.
    ///
    /// Fails only if the request is invalid, the worker is overloaded, or the shared cache is
    /// unavailable. Everything else is reported per module in the response.
    pub async fn symbolicate(
        &self,
        request: SymbolicationRequest,
        options: RequestOptions,
    ) -> Result<SymbolicationResponse, SymbolicationError> {
        let current = self.current_requests.fetch_add(1, Ordering::Relaxed);
        let _guard = defer(|| {
            self.current_requests.fetch_sub(1, Ordering::Relaxed);
        });
        if self.max_concurrent_requests.is_some_and(|max| current >= max) {
            metric!(counter("requests.rejected") += 1);
            return Err(MaxRequestsError.into());
        }

        let jobs = request
            .jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| Job::validate(index, job))
            .collect::<Result<Vec<_>, _>>()?;

        let start = Instant::now();
        let fetches = self.resolve_modules(&jobs, options.include_try).await?;
        let resolve_time = start.elapsed();

        let mut frames_symbolicated = 0;
        let results = jobs
            .iter()
            .map(|job| {
                let result = symbolicate_job(job, &fetches);
                frames_symbolicated += result.stacks.iter().flatten().count();
                result
            })
            .collect();

        tracing::debug!(
            modules = fetches.len(),
            frames = frames_symbolicated,
            "Symbolicated batch in {:?}",
            resolve_time
        );

        let debug = options.debug.then(|| DebugInfo {
            modules_looked_up: fetches.len(),
            frames_symbolicated,
            modules: fetches
                .iter()
                .map(|(module, fetch)| (module.to_string(), diagnostics(fetch)))
                .collect(),
            resolve_ms: resolve_time.as_millis() as u64,
        });

        Ok(SymbolicationResponse { results, debug })
    }

    /// Fetches the lookup tables of all modules referenced by `jobs`, each module once.
    async fn resolve_modules(
        &self,
        jobs: &[Job],
        include_try: bool,
    ) -> Result<HashMap<ModuleKey, SymCacheFetch>, SymbolicationError> {
        let mut modules: Vec<&ModuleKey> = Vec::new();
        let mut seen = HashSet::new();
        for job in jobs {
            for module in job.referenced_modules() {
                if seen.insert(module) {
                    modules.push(module);
                }
            }
        }

        let fetches = futures::future::join_all(modules.iter().map(|module| {
            let key = CacheKey::new((*module).clone(), include_try);
            async move { self.symcaches.fetch(&key).await }
        }))
        .await;

        let mut resolved = HashMap::with_capacity(modules.len());
        for (module, fetch) in modules.into_iter().zip(fetches) {
            let fetch = fetch.map_err(SymbolicationError::StoreUnavailable)?;
            let status = match &fetch.table {
                Ok(_) => "found",
                Err(err) => err.as_str(),
            };
            metric!(counter("symbolication.modules") += 1, "status" => status);
            resolved.insert(module.clone(), fetch);
        }

        Ok(resolved)
    }
}

fn symbolicate_job(job: &Job, fetches: &HashMap<ModuleKey, SymCacheFetch>) -> JobResult {
    let stacks = job
        .stacks
        .iter()
        .map(|stack| {
            stack
                .iter()
                .enumerate()
                .map(|(index, frame)| symbolicate_frame(job, index, frame, fetches))
                .collect()
        })
        .collect();

    let referenced = job.referenced_modules();
    let found_modules = job
        .modules
        .iter()
        .map(|module| {
            let found = referenced
                .contains(module)
                .then(|| fetches.get(module).is_some_and(|f| f.table.is_ok()));
            (module.to_string(), found)
        })
        .collect();

    JobResult {
        stacks,
        found_modules,
    }
}

fn symbolicate_frame(
    job: &Job,
    index: usize,
    frame: &RawFrame,
    fetches: &HashMap<ModuleKey, SymCacheFetch>,
) -> SymbolicatedFrame {
    let RawFrame(_, HexValue(offset)) = *frame;
    let mut symbolicated = SymbolicatedFrame {
        frame: index,
        module_offset: HexValue(offset),
        ..Default::default()
    };

    let Some(module) = job.module_of(frame) else {
        return symbolicated;
    };
    symbolicated.module = Some(module.debug_filename().to_owned());

    let table = fetches.get(module).and_then(|fetch| fetch.table.as_ref().ok());
    if let Some(symbol) = table.and_then(|table| table.lookup(offset)) {
        symbolicated.function = Some(symbol.function);
        symbolicated.function_offset = Some(HexValue(symbol.function_offset));
    }

    symbolicated
}

fn diagnostics(fetch: &SymCacheFetch) -> ModuleDiagnostics {
    ModuleDiagnostics {
        found: fetch.table.is_ok(),
        status: fetch.status,
        source: fetch.source.clone(),
        size: fetch.size,
        download_ms: fetch.download_time.map(|d| d.as_millis() as u64),
        convert_ms: fetch.convert_time.map(|d| d.as_millis() as u64),
        error: fetch.table.as_ref().err().map(ToString::to_string),
    }
}
