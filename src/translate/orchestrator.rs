use std::path::Path;
use std::process::ExitStatus;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::manifest::{
    prepare_source, read_result_file, remove_quietly, write_source_items, Manifest, TranslationJob, WorkArea,
};
use super::pivot::{pivot_source, PivotPass};
use super::WorkerLauncher;
use crate::config::{Config, TargetLanguage};
use crate::error::{Result, SubforgeError};
use crate::models::ModelManager;
use crate::process::{kill_process_group, terminate_child, ProcessRegistry};
use crate::resume::ResumeStore;
use crate::subtitle::Segment;

/// What one translation stage achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationReport {
    /// Targets already satisfied before the stage started
    pub skipped: Vec<String>,
    /// Targets checkpointed by this stage, in the order they were observed
    pub completed: Vec<String>,
    /// Targets still missing, retried on the next run
    pub pending: Vec<String>,
    pub pivoted: bool,
}

pub struct TranslationOrchestrator<'a> {
    config: &'a Config,
    launcher: &'a dyn WorkerLauncher,
    registry: ProcessRegistry,
    batch_size: usize,
}

impl<'a> TranslationOrchestrator<'a> {
    pub fn new(config: &'a Config, launcher: &'a dyn WorkerLauncher, registry: ProcessRegistry, batch_size: usize) -> Self {
        Self {
            config,
            launcher,
            registry,
            batch_size: batch_size.max(1),
        }
    }

    /// Configured targets, minus the source language, split into
    /// (missing, already satisfied).
    pub async fn missing_targets(&self, store: &ResumeStore, src_lang: &str) -> (Vec<TargetLanguage>, Vec<String>) {
        let mut missing = Vec::new();
        let mut skipped = Vec::new();
        for target in &self.config.target_languages {
            if target.lang == src_lang {
                continue;
            }
            if store.is_target_satisfied(&target.lang).await {
                skipped.push(target.lang.clone());
            } else {
                missing.push(target.clone());
            }
        }
        (missing, skipped)
    }

    /// One job per missing target, all sharing the common input file.
    pub fn build_manifest(&self, missing: &[TargetLanguage], src_code: &str, area: &WorkArea) -> Manifest {
        let jobs = missing
            .iter()
            .map(|target| TranslationJob {
                lang: target.lang.clone(),
                label: target.label.clone(),
                tgt_code: target.code.clone(),
                src_code: src_code.to_string(),
                input_path: area.common_input_path(),
                output_path: area.result_path(&target.lang),
            })
            .collect();
        Manifest { jobs }
    }

    /// Translate `segments` into every unsatisfied target, writing a
    /// checkpoint per language as results arrive.
    pub async fn translate(
        &self,
        segments: &[Segment],
        src_lang: &str,
        store: &ResumeStore,
        models: &mut ModelManager,
    ) -> Result<TranslationReport> {
        let (mut missing, skipped) = self.missing_targets(store, src_lang).await;
        let total = self.config.target_languages.len();
        info!(
            "Translation status: {} targets, {} to do, {} already done",
            total,
            missing.len(),
            skipped.len()
        );
        let mut report = TranslationReport {
            skipped,
            ..TranslationReport::default()
        };
        if missing.is_empty() {
            info!("All target languages are already translated");
            return Ok(report);
        }

        models.offload_transcriber().await;
        models.offload_separator().await;

        let mut source = prepare_source(segments);
        if source.is_empty() {
            warn!("No text to translate");
            report.pending = missing.iter().map(|t| t.lang.clone()).collect();
            return Ok(report);
        }

        let area = WorkArea::new(store.folder(), store.base_name());
        let mut src_code = self.config.model_code(src_lang);

        let pivot_lang = self.config.translator.pivot_language.as_str();
        if self.config.translator.pivot_enabled && src_lang != pivot_lang {
            let pivot_code = self.config.model_code(pivot_lang);
            let pass = PivotPass {
                launcher: self.launcher,
                registry: &self.registry,
                worker: &self.config.worker,
                area: &area,
                batch_size: self.batch_size,
            };
            let label = format!("Pivot: {}", self.config.label(pivot_lang));

            match pass.run(&source, &src_code, &pivot_code, &label).await {
                Ok(lines) => {
                    if let Some(idx) = missing.iter().position(|t| t.lang == pivot_lang) {
                        match store.save_translated(pivot_lang, &source, &lines).await {
                            Ok(path) => {
                                info!("Pivot checkpoint saved: {}", path.display());
                                missing.remove(idx);
                                report.completed.push(pivot_lang.to_string());
                            }
                            Err(e) => warn!("Could not save pivot checkpoint: {}", e),
                        }
                    }
                    source = pivot_source(&source, &lines);
                    src_code = pivot_code;
                    report.pivoted = true;
                    info!("Pivot to {} succeeded, using it as source", pivot_lang);
                }
                Err(e) => warn!("Pivot pass failed, translating directly from source: {}", e),
            }
        }

        if missing.is_empty() {
            return Ok(report);
        }

        let (completed, pending) = self.run_batch(missing, &source, &src_code, store, &area).await;
        report.completed.extend(completed);
        report.pending = pending;
        Ok(report)
    }

    /// Launch one worker for every missing target and consume its results.
    /// Returns (completed, pending) language codes; never fails the stage.
    async fn run_batch(
        &self,
        missing: Vec<TargetLanguage>,
        source: &[Segment],
        src_code: &str,
        store: &ResumeStore,
        area: &WorkArea,
    ) -> (Vec<String>, Vec<String>) {
        let manifest = self.build_manifest(&missing, src_code, area);
        let mut pending = missing;
        let mut completed = Vec::new();

        info!("Translating {} languages via isolated worker", pending.len());
        match self.launch(&manifest, source, area).await {
            Ok(mut child) => {
                let pid = child.id();
                match self.poll_worker(&mut child, &mut pending, &mut completed, source, store, area).await {
                    Ok(status) if status.success() => info!("Translation worker finished"),
                    Ok(status) => error!("Translation worker failed: {}", status),
                    Err(e) => error!("Lost track of translation worker: {}", e),
                }

                if let Ok(None) = child.try_wait() {
                    warn!("Translation worker still running, terminating it");
                    if let Err(e) = terminate_child(&mut child, self.config.worker.terminate_grace()).await {
                        error!("Could not terminate translation worker: {}", e);
                    }
                }
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                    self.registry.unregister(pid);
                }
            }
            Err(e) => error!("Translation worker could not start: {}", e),
        }

        remove_quietly(&area.manifest_path()).await;
        remove_quietly(&area.common_input_path()).await;
        for job in &manifest.jobs {
            remove_quietly(&job.output_path).await;
        }

        let pending: Vec<String> = pending.into_iter().map(|t| t.lang).collect();
        if !pending.is_empty() {
            warn!("Languages left for the next run: {}", pending.join(", "));
        }
        (completed, pending)
    }

    async fn launch(&self, manifest: &Manifest, source: &[Segment], area: &WorkArea) -> Result<Child> {
        for job in &manifest.jobs {
            remove_quietly(&job.output_path).await;
        }
        write_source_items(&area.common_input_path(), source).await?;
        manifest.write(&area.manifest_path()).await?;

        let mut cmd = self.launcher.command();
        cmd.arg("--batch").arg(area.manifest_path());
        let child = cmd
            .spawn()
            .map_err(|e| SubforgeError::Worker(format!("Failed to start translation worker: {}", e)))?;
        if let Some(pid) = child.id() {
            self.registry.register(pid);
        }
        Ok(child)
    }

    async fn poll_worker(
        &self,
        child: &mut Child,
        pending: &mut Vec<TargetLanguage>,
        completed: &mut Vec<String>,
        source: &[Segment],
        store: &ResumeStore,
        area: &WorkArea,
    ) -> Result<ExitStatus> {
        let interval = self.config.worker.poll_interval();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            self.consume_ready(pending, completed, source, store, area).await;
            tokio::time::sleep(interval).await;
        };

        // results published between the last poll and the exit
        self.consume_ready(pending, completed, source, store, area).await;
        Ok(status)
    }

    async fn consume_ready(
        &self,
        pending: &mut Vec<TargetLanguage>,
        completed: &mut Vec<String>,
        source: &[Segment],
        store: &ResumeStore,
        area: &WorkArea,
    ) {
        let mut i = 0;
        while i < pending.len() {
            let lang = pending[i].lang.clone();
            let path = area.result_path(&lang);
            if path.exists() && self.consume(&lang, &path, source, store).await {
                pending.remove(i);
                completed.push(lang);
            } else {
                i += 1;
            }
        }
    }

    /// Checkpoint one result file, then delete it to acknowledge the worker.
    /// A mismatched or unreadable result is deleted too but leaves the
    /// language pending.
    async fn consume(&self, lang: &str, path: &Path, source: &[Segment], store: &ResumeStore) -> bool {
        let worker = &self.config.worker;
        let saved = match read_result_file(path, worker.read_retries, worker.read_backoff()).await {
            Ok(lines) if lines.len() == source.len() => match store.save_translated(lang, source, &lines).await {
                Ok(checkpoint) => {
                    info!("Saved {} translation: {}", lang, checkpoint.display());
                    true
                }
                Err(e) => {
                    error!("Could not save {} checkpoint: {}", lang, e);
                    false
                }
            },
            Ok(lines) => {
                error!(
                    "Length mismatch for {}: {} translations for {} segments",
                    lang,
                    lines.len(),
                    source.len()
                );
                false
            }
            Err(e) => {
                error!("Could not consume {} result: {}", lang, e);
                false
            }
        };

        remove_quietly(path).await;
        debug!("Acknowledged {} result", lang);
        saved
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::MockModelProvider;
    use crate::subtitle::read_srt;
    use tokio::process::Command;

    struct ScriptLauncher(String);

    impl WorkerLauncher for ScriptLauncher {
        fn command(&self) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.0).arg("worker");
            cmd.kill_on_drop(true);
            cmd
        }
    }

    // publish $2 into $1 atomically, then wait (bounded) for the parent to delete it
    const PUBLISH: &str = r#"publish() { printf '%s' "$2" > "$1.part" && mv "$1.part" "$1"; n=0; while [ -e "$1" ] && [ $n -lt 100 ]; do sleep 0.05; n=$((n+1)); done; }"#;

    fn config(targets: &[(&str, &str, &str)]) -> Config {
        let mut config = Config::default();
        config.target_languages = targets
            .iter()
            .map(|(lang, code, label)| TargetLanguage::new(lang, code, label))
            .collect();
        config.worker.poll_interval_ms = 20;
        config.worker.read_backoff_ms = 10;
        config.worker.terminate_grace_secs = 1;
        config
    }

    fn models() -> ModelManager {
        ModelManager::new(Box::new(MockModelProvider::new()))
    }

    fn segments() -> Vec<Segment> {
        vec![
            Segment::new(0.0, 1.0, "first"),
            Segment::new(1.0, 2.0, "   "),
            Segment::new(2.0, 3.0, "second"),
        ]
    }

    #[tokio::test]
    async fn manifest_has_one_job_per_missing_language() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&[("en", "eng_Latn", "English"), ("es", "spa_Latn", "Spanish"), ("fr", "fra_Latn", "French")]);
        let launcher = ScriptLauncher("exit 0".to_string());
        let orchestrator = TranslationOrchestrator::new(&config, &launcher, ProcessRegistry::new(), 4);
        let store = ResumeStore::new(dir.path(), "film", vec![]);
        std::fs::write(store.checkpoint_path("fr"), "1\n00:00:00,000 --> 00:00:01,000\nSalut\n\n").unwrap();

        let (missing, skipped) = orchestrator.missing_targets(&store, "en").await;
        assert_eq!(skipped, vec!["fr"]);
        let area = WorkArea::new(dir.path(), "film");
        let manifest = orchestrator.build_manifest(&missing, "eng_Latn", &area);

        assert_eq!(manifest.jobs.len(), 1);
        let job = &manifest.jobs[0];
        assert_eq!(job.lang, "es");
        assert_eq!(job.src_code, "eng_Latn");
        assert_eq!(job.tgt_code, "spa_Latn");
        assert_eq!(job.input_path, area.common_input_path());
    }

    #[tokio::test]
    async fn consumes_results_and_leaves_mismatches_pending() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkArea::new(dir.path(), "film");
        let snapshot = dir.path().join("seen_manifest.json");
        let script = format!(
            "{PUBLISH}\ncp \"$2\" '{}'\npublish '{}' '[\"Hola\",\"segundo\"]'\npublish '{}' '[\"Bonjour\"]'\n",
            snapshot.display(),
            area.result_path("es").display(),
            area.result_path("fr").display(),
        );
        let config = config(&[("en", "eng_Latn", "English"), ("es", "spa_Latn", "Spanish"), ("fr", "fra_Latn", "French")]);
        let launcher = ScriptLauncher(script);
        let orchestrator = TranslationOrchestrator::new(&config, &launcher, ProcessRegistry::new(), 4);
        let store = ResumeStore::new(dir.path(), "film", vec![]);

        let report = orchestrator.translate(&segments(), "en", &store, &mut models()).await.unwrap();

        assert_eq!(report.completed, vec!["es"]);
        assert_eq!(report.pending, vec!["fr"]);
        let es = read_srt(&store.checkpoint_path("es")).await.unwrap();
        assert_eq!(es.len(), 2);
        assert_eq!(es[1].text, "segundo");
        assert_eq!(es[1].start, 2.0);
        assert!(!store.checkpoint_path("fr").exists());

        let seen = Manifest::read(&snapshot).await.unwrap();
        assert_eq!(seen.jobs.len(), 2);
        assert!(!area.manifest_path().exists());
        assert!(!area.common_input_path().exists());
        assert!(!area.result_path("es").exists());
        assert!(!area.result_path("fr").exists());
    }

    #[tokio::test]
    async fn final_pass_picks_up_results_written_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkArea::new(dir.path(), "film");
        let out = area.result_path("es");
        // publish without waiting for acknowledgment, then exit before the next poll
        let script = format!(
            "sleep 0.2\nprintf '[\"Hola\",\"dos\"]' > '{0}.part' && mv '{0}.part' '{0}'\n",
            out.display()
        );
        let mut config = config(&[("es", "spa_Latn", "Spanish")]);
        config.worker.poll_interval_ms = 1500;
        let launcher = ScriptLauncher(script);
        let orchestrator = TranslationOrchestrator::new(&config, &launcher, ProcessRegistry::new(), 4);
        let store = ResumeStore::new(dir.path(), "film", vec![]);

        let report = orchestrator.translate(&segments(), "en", &store, &mut models()).await.unwrap();
        assert_eq!(report.completed, vec!["es"]);
        assert!(store.is_target_satisfied("es").await);
    }

    #[tokio::test]
    async fn failed_worker_is_logged_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&[("es", "spa_Latn", "Spanish")]);
        let launcher = ScriptLauncher("exit 3".to_string());
        let orchestrator = TranslationOrchestrator::new(&config, &launcher, ProcessRegistry::new(), 4);
        let store = ResumeStore::new(dir.path(), "film", vec![]);

        let report = orchestrator.translate(&segments(), "en", &store, &mut models()).await.unwrap();
        assert!(report.completed.is_empty());
        assert_eq!(report.pending, vec!["es"]);
        assert!(!WorkArea::new(dir.path(), "film").manifest_path().exists());
    }

    #[tokio::test]
    async fn pivot_satisfies_pivot_target_and_feeds_remaining_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkArea::new(dir.path(), "film");
        let seen_input = dir.path().join("seen_input.json");
        let seen_manifest = dir.path().join("seen_manifest.json");
        let script = format!(
            "{PUBLISH}\nif [ \"$1\" = \"--batch\" ]; then\n  cp \"$2\" '{}'\n  cp '{}' '{}'\n  publish '{}' '[\"Hola\",\"Segundo\"]'\nelse\n  printf '[\"Hello\",\"Second\"]' > \"$2\"\nfi\n",
            seen_manifest.display(),
            area.common_input_path().display(),
            seen_input.display(),
            area.result_path("es").display(),
        );
        let config = config(&[("en", "eng_Latn", "English"), ("es", "spa_Latn", "Spanish")]);
        let launcher = ScriptLauncher(script);
        let orchestrator = TranslationOrchestrator::new(&config, &launcher, ProcessRegistry::new(), 4);
        let store = ResumeStore::new(dir.path(), "film", vec![]);

        let report = orchestrator.translate(&segments(), "ro", &store, &mut models()).await.unwrap();

        assert!(report.pivoted);
        assert_eq!(report.completed, vec!["en", "es"]);
        let en = read_srt(&store.checkpoint_path("en")).await.unwrap();
        assert_eq!(en[0].text, "Hello");

        let manifest = Manifest::read(&seen_manifest).await.unwrap();
        assert_eq!(manifest.jobs.len(), 1);
        assert_eq!(manifest.jobs[0].lang, "es");
        assert_eq!(manifest.jobs[0].src_code, "eng_Latn");

        let input: Vec<Segment> = serde_json::from_slice(&std::fs::read(&seen_input).unwrap()).unwrap();
        assert_eq!(input[0].text, "Hello");
        assert_eq!(input[1].start, 2.0);
        assert!(!area.pivot_input_path().exists());
        assert!(!area.pivot_output_path().exists());
    }

    #[tokio::test]
    async fn failed_pivot_falls_back_to_direct_translation() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkArea::new(dir.path(), "film");
        let seen_manifest = dir.path().join("seen_manifest.json");
        let script = format!(
            "{PUBLISH}\nif [ \"$1\" != \"--batch\" ]; then exit 1; fi\ncp \"$2\" '{}'\npublish '{}' '[\"Hello\",\"Second\"]'\npublish '{}' '[\"Hola\",\"Segundo\"]'\n",
            seen_manifest.display(),
            area.result_path("en").display(),
            area.result_path("es").display(),
        );
        let config = config(&[("en", "eng_Latn", "English"), ("es", "spa_Latn", "Spanish")]);
        let launcher = ScriptLauncher(script);
        let orchestrator = TranslationOrchestrator::new(&config, &launcher, ProcessRegistry::new(), 4);
        let store = ResumeStore::new(dir.path(), "film", vec![]);

        let report = orchestrator.translate(&segments(), "ro", &store, &mut models()).await.unwrap();

        assert!(!report.pivoted);
        assert_eq!(report.completed, vec!["en", "es"]);
        let manifest = Manifest::read(&seen_manifest).await.unwrap();
        assert_eq!(manifest.jobs.len(), 2);
        assert!(manifest.jobs.iter().all(|j| j.src_code == "ron_Latn"));
    }

    #[tokio::test]
    async fn nothing_to_do_when_every_target_is_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&[("en", "eng_Latn", "English")]);
        // would fail loudly if it were ever started
        let launcher = ScriptLauncher("exit 9".to_string());
        let orchestrator = TranslationOrchestrator::new(&config, &launcher, ProcessRegistry::new(), 4);
        let store = ResumeStore::new(dir.path(), "film", vec![]);

        let report = orchestrator.translate(&segments(), "en", &store, &mut models()).await.unwrap();
        assert_eq!(report, TranslationReport::default());
    }
}
