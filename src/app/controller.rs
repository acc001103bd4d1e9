use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::runtime::Handle;

use crate::app::lock::{JobLease, LockTable};
use crate::app::model::{DumpOutcome, DumpStatus, job_key};
use crate::chapter::{ChapterBookBuilder, ChapterContent, ChapterNumbering};
use crate::debounce::MergeScheduler;
use crate::deobfuscate::Deobfuscator;
use crate::error::PipelineError;
use crate::fetch::Upstream;
use crate::images::{CoverSource, ImageInliner, resolve_cover};
use crate::model::{Collection, DumpRequest, VolumeMetadata};
use crate::paths::{
    chapter_file_stem, escape_chapter_ref, existing_book_stems, is_site_relative, volume_dir,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChapterRef {
    raw: String,
    stem: String,
}

/// One admitted dump request; lives for one background run.
#[derive(Debug)]
struct VolumeJob {
    key: String,
    folder: PathBuf,
    metadata: VolumeMetadata,
    missing: Vec<ChapterRef>,
    total_chapters: usize,
}

/// Admits volume jobs, one per novel and volume, and runs them in the
/// background.
pub struct VolumeJobController {
    root: PathBuf,
    upstream: Arc<dyn Upstream>,
    deobfuscator: Deobfuscator,
    inliner: ImageInliner,
    builder: ChapterBookBuilder,
    scheduler: Arc<MergeScheduler>,
    locks: Arc<LockTable>,
    runtime: Handle,
}

impl VolumeJobController {
    pub fn new(
        root: impl Into<PathBuf>,
        upstream: Arc<dyn Upstream>,
        deobfuscator: Deobfuscator,
        numbering: Arc<dyn ChapterNumbering>,
        scheduler: Arc<MergeScheduler>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            inliner: ImageInliner::new(Arc::clone(&upstream)),
            builder: ChapterBookBuilder::new(numbering, Arc::clone(&scheduler)),
            upstream,
            deobfuscator,
            scheduler,
            locks: LockTable::new(),
            runtime,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upstream(&self) -> &dyn Upstream {
        self.upstream.as_ref()
    }

    pub fn builder(&self) -> &ChapterBookBuilder {
        &self.builder
    }

    /// Whether a job writes into the default folder of `novel`/`volume`.
    pub fn is_running(&self, novel: &str, volume: &str) -> bool {
        self.is_busy(&volume_dir(
            &self.root,
            novel,
            volume,
            &VolumeMetadata::default(),
        ))
    }

    pub fn is_busy(&self, folder: &Path) -> bool {
        self.locks.is_held(&job_key(folder))
    }

    /// Decides admission synchronously and, when chapters are missing, starts
    /// the job on the injected runtime.
    pub fn request_dump(
        self: &Arc<Self>,
        novel: &str,
        volume: &str,
        request: DumpRequest,
    ) -> anyhow::Result<DumpOutcome> {
        let novel = novel.trim();
        let volume = volume.trim();
        if novel.is_empty() || volume.is_empty() {
            return Err(
                PipelineError::Validation("novel and volume are required".to_string()).into(),
            );
        }
        let chapters = parse_chapter_refs(&request.chapters)?;

        let mut metadata = request.metadata;
        let folder = volume_dir(&self.root, novel, volume, &metadata);
        // Keyed on the folder: two URLs naming the same volume share one slot.
        let key = job_key(&folder);
        let Some(lease) = self.locks.try_acquire(&key) else {
            tracing::info!(key = %key, "volume job already running");
            return Ok(DumpOutcome::rejected(DumpStatus::AlreadyRunning));
        };

        let present = existing_book_stems(&folder)?;
        let total_chapters = chapters.len();
        let (saved, missing): (Vec<_>, Vec<_>) = chapters
            .into_iter()
            .partition(|chapter| present.contains(&chapter.stem));

        if missing.is_empty() {
            // No worker will run; `lease` is released on return.
            tracing::info!(key = %key, folder = %folder.display(), "volume already complete");
            return Ok(DumpOutcome::rejected(DumpStatus::AlreadyComplete));
        }

        if metadata.collections.is_empty() {
            metadata.collections.push(Collection {
                name: novel.to_string(),
                id: None,
                number: None,
                kind: None,
            });
        }

        let status = if saved.is_empty() {
            DumpStatus::AllAccepted
        } else {
            DumpStatus::PartialAccepted
        };
        let accepted = missing
            .iter()
            .map(|chapter| escape_chapter_ref(&chapter.raw))
            .collect();

        tracing::info!(
            key = %key,
            folder = %folder.display(),
            missing = missing.len(),
            present = saved.len(),
            "volume job admitted"
        );
        let job = VolumeJob {
            key,
            folder,
            metadata,
            missing,
            total_chapters,
        };
        let controller = Arc::clone(self);
        self.runtime.spawn(async move {
            controller.run_job(job, lease).await;
        });

        Ok(DumpOutcome { status, accepted })
    }

    async fn run_job(&self, job: VolumeJob, lease: JobLease) {
        if let Err(err) = self.try_run_job(&job).await {
            tracing::error!(key = %job.key, ?err, "volume job aborted");
        }
        drop(lease);
    }

    async fn try_run_job(&self, job: &VolumeJob) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&job.folder)
            .await
            .map_err(PipelineError::from)
            .with_context(|| format!("create volume dir: {}", job.folder.display()))?;

        let cover = resolve_cover(job.metadata.cover.as_deref(), self.upstream.as_ref())
            .await
            .context("resolve cover")?;

        for chapter in &job.missing {
            self.process_chapter(job, chapter, &cover)
                .await
                .with_context(|| format!("chapter {}", chapter.raw))?;
        }

        tracing::info!(key = %job.key, chapters = job.missing.len(), "volume job finished");
        self.scheduler.fire_now(&job.folder).await;
        Ok(())
    }

    async fn process_chapter(
        &self,
        job: &VolumeJob,
        chapter: &ChapterRef,
        cover: &CoverSource,
    ) -> anyhow::Result<()> {
        let raw = self.upstream.fetch_chapter(&chapter.raw).await?;
        let html = self.deobfuscator.clean(&raw.html, &raw.stylesheet)?;
        let html = self.inliner.inline(&html).await?;

        let content = ChapterContent {
            title: raw.title.unwrap_or_else(|| chapter.stem.clone()),
            stem: chapter.stem.clone(),
            html,
        };
        let book = self
            .builder
            .build(&content, &job.metadata, job.total_chapters, cover);
        self.builder.save(book, &job.folder, &chapter.stem).await?;
        Ok(())
    }
}

/// Deduplicated references with their file stems, in request order.
fn parse_chapter_refs(refs: &[String]) -> Result<Vec<ChapterRef>, PipelineError> {
    let mut seen = HashSet::new();
    let mut chapters = Vec::with_capacity(refs.len());
    for raw in refs {
        if !is_site_relative(raw) {
            return Err(PipelineError::Validation(format!(
                "chapter reference must be a path on the source site: {raw:?}"
            )));
        }
        let stem = chapter_file_stem(raw).ok_or_else(|| {
            PipelineError::Validation(format!("chapter reference has no file name: {raw:?}"))
        })?;
        if seen.insert(stem.clone()) {
            chapters.push(ChapterRef {
                raw: raw.trim().to_string(),
                stem,
            });
        }
    }
    Ok(chapters)
}
