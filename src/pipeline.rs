//! One generation pipeline for every route: load references, composite
//! them per role, generate each planned shot, store the result, then
//! charge for what was produced.

use crate::cancel::CancellationStore;
use crate::category::{
    analyze_prompt, shot_plan, Category, PromptBuilder, PromptContext, ReferenceRole, Route,
};
use crate::compositor::{self, CompositeError};
use crate::gemini::{Content, GenerationConfig, Part, ProviderError};
use crate::ledger::{Actor, Charge, CreditLedger, DebitReceipt, LedgerError};
use crate::retry::RetryClient;
use crate::storage::{encode_for_upload, generated_path, ObjectStorage};
use crate::store::{JobStore, Progress};
use crate::{non_blank, Attachment, Job, JobInput, NewAttachment, Status};
use base64::Engine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Composite(#[from] CompositeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("record store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("modify job has no source image")]
    MissingSource,

    #[error("invalid image payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub credential: String,
    pub model: String,
    pub price_per_image: i64,
}

/// Final state of one processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: Status,
    pub attachment_ids: Vec<i64>,
    pub error: Option<String>,
}

impl JobOutcome {
    fn cancelled(attachment_ids: Vec<i64>) -> Self {
        JobOutcome {
            status: Status::UserCancelled,
            attachment_ids,
            error: None,
        }
    }
}

/// Accepts `data:<mime>;base64,<payload>` or a bare base64 payload.
pub fn decode_data_url(value: &str) -> Result<Vec<u8>, PipelineError> {
    let payload = match value.split_once(";base64,") {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => value,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| PipelineError::InvalidPayload(e.to_string()))
}

#[derive(Clone)]
pub struct Pipeline {
    jobs: Arc<dyn JobStore>,
    ledger: CreditLedger,
    storage: Arc<dyn ObjectStorage>,
    cancel: CancellationStore,
    retry: RetryClient,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: CreditLedger,
        storage: Arc<dyn ObjectStorage>,
        cancel: CancellationStore,
        retry: RetryClient,
        settings: PipelineSettings,
    ) -> Self {
        Pipeline {
            jobs,
            ledger,
            storage,
            cancel,
            retry,
            settings,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    pub fn cancellation(&self) -> &CancellationStore {
        &self.cancel
    }

    pub fn price_per_image(&self) -> i64 {
        self.settings.price_per_image
    }

    /// Runs a queued job to a terminal outcome. Never leaves produced
    /// images uncharged, whatever the outcome.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, route = %route))]
    pub async fn process(&self, job: &Job, route: Route) -> JobOutcome {
        let mut progress = Progress::new(job.total_images.max(1), &job.generated_attachment_ids);

        if self.cancel.is_cancelled(&job.job_id).await {
            info!("Job cancelled before start");
            return JobOutcome::cancelled(progress.attachment_ids().to_vec());
        }

        let input = job.parsed_input();
        let run = self.run(job, route, &input, &mut progress).await;

        let (status, mut error) = match run {
            Ok(status) => (status, None),
            Err(err) => {
                warn!(error = %err, "Generation stopped");
                (Status::Failed, Some(err.to_string()))
            }
        };

        if let Err(err) = self.charge_job(job, &input, progress.attachment_ids()).await {
            warn!(error = %err, "Charging failed");
            error = Some(match error {
                Some(previous) => format!("{previous}; {err}"),
                None => err.to_string(),
            });
        }

        let status = if error.is_some() { Status::Failed } else { status };
        info!(%status, images = progress.completed(), "Job processed");
        JobOutcome {
            status,
            attachment_ids: progress.attachment_ids().to_vec(),
            error,
        }
    }

    async fn run(
        &self,
        job: &Job,
        route: Route,
        input: &JobInput,
        progress: &mut Progress,
    ) -> Result<Status, PipelineError> {
        let aspect_ratio = input.aspect_ratio();
        let references = self.load_references(route, input).await?;
        let (roles, images) = self.group_references(references, aspect_ratio)?;

        let builder = route.prompt_builder();
        let config = GenerationConfig::image(aspect_ratio, builder.temperature());
        let total = job.total_images.max(1) as usize;
        let plan = shot_plan(&input.combinations, total);
        let owner = job_owner(job, input).unwrap_or("guest");

        for (index, shot) in plan.iter().enumerate().skip(progress.completed() as usize) {
            if self.cancel.is_cancelled(&job.job_id).await {
                info!(index, "Job cancelled between images");
                return Ok(Status::UserCancelled);
            }

            let text = builder.build(&PromptContext {
                user_prompt: input.prompt(),
                aspect_ratio,
                roles: &roles,
                shot: Some(shot),
            });
            let mut parts = vec![Part::Text(text)];
            parts.extend(images.iter().cloned().map(Part::image));
            let content = Content { parts };

            let response = self
                .retry
                .generate(&self.settings.credential, &self.settings.model, &content, &config)
                .await?;
            let image = response.first_image()?;

            if self.cancel.is_cancelled(&job.job_id).await {
                info!(index, "Job cancelled during generation, discarding image");
                return Ok(Status::UserCancelled);
            }

            let attachment = self.store_generated(owner, image).await?;
            progress.record(attachment.id);
            if let Err(err) = self
                .jobs
                .update_progress(&job.job_id, progress.completed(), progress.attachment_ids())
                .await
            {
                warn!(error = %err, "Failed to record progress");
            }
            info!(
                index,
                total,
                attachment_id = attachment.id,
                "Image generated"
            );
        }

        Ok(Status::Completed)
    }

    async fn load_references(
        &self,
        route: Route,
        input: &JobInput,
    ) -> Result<Vec<(ReferenceRole, Vec<u8>)>, PipelineError> {
        let mut references = Vec::new();

        if let Some(url) = non_blank(input.original_image_url.as_deref()) {
            match self.storage.fetch_url(url).await {
                Ok(bytes) => references.push((ReferenceRole::Reference, bytes)),
                Err(err) => warn!(error = %err, "Failed to fetch original image"),
            }
        }

        for item in &input.attachments {
            let role = match (ReferenceRole::classify(&item.kind), route) {
                (Some(role), _) => role,
                (None, Route::Modify) => ReferenceRole::Reference,
                (None, _) => {
                    warn!(attachment_id = item.attachment_id, kind = %item.kind, "Unknown reference type, skipping");
                    continue;
                }
            };
            let attachment = match self.jobs.fetch_attachment(item.attachment_id).await {
                Ok(Some(attachment)) => attachment,
                Ok(None) => {
                    warn!(attachment_id = item.attachment_id, "Reference attachment missing");
                    continue;
                }
                Err(err) => return Err(PipelineError::Store(err)),
            };
            match self.storage.download(&attachment.file_path).await {
                Ok(bytes) => references.push((role, bytes)),
                Err(err) => {
                    warn!(attachment_id = item.attachment_id, error = %err, "Failed to download reference")
                }
            }
        }

        for encoded in &input.reference_images {
            match decode_data_url(encoded) {
                Ok(bytes) => references.push((ReferenceRole::Reference, bytes)),
                Err(err) => warn!(error = %err, "Skipping undecodable reference image"),
            }
        }

        if let Some(mask) = non_blank(input.mask_data_url.as_deref()) {
            references.push((ReferenceRole::Mask, decode_data_url(mask)?));
        }

        if route == Route::Modify
            && !references
                .iter()
                .any(|(role, _)| *role != ReferenceRole::Mask)
        {
            return Err(PipelineError::MissingSource);
        }

        debug!(count = references.len(), "References loaded");
        Ok(references)
    }

    /// One image per role, in send order; roles with several images are
    /// composited.
    fn group_references(
        &self,
        references: Vec<(ReferenceRole, Vec<u8>)>,
        aspect_ratio: &str,
    ) -> Result<(Vec<ReferenceRole>, Vec<Vec<u8>>), PipelineError> {
        let mut by_role: BTreeMap<ReferenceRole, Vec<Vec<u8>>> = BTreeMap::new();
        for (role, bytes) in references {
            by_role.entry(role).or_default().push(bytes);
        }

        let mut roles = Vec::with_capacity(by_role.len());
        let mut images = Vec::with_capacity(by_role.len());
        for (role, group) in by_role {
            if group.len() > 1 {
                debug!(?role, count = group.len(), "Compositing role images");
            }
            images.push(compositor::merge(&group, aspect_ratio)?);
            roles.push(role);
        }
        Ok((roles, images))
    }

    /// Re-encodes, uploads and records one generated image.
    pub async fn store_generated(&self, owner: &str, image: Vec<u8>) -> Result<Attachment, PipelineError> {
        let encoded = encode_for_upload(image);
        let path = generated_path(owner, encoded.extension);
        let file_size = encoded.bytes.len() as i64;

        self.storage
            .upload(&path, encoded.bytes, encoded.mime_type)
            .await
            .map_err(PipelineError::Storage)?;

        self.jobs
            .create_attachment(&NewAttachment {
                file_path: path,
                file_size,
                mime_type: encoded.mime_type.to_string(),
            })
            .await
            .map_err(PipelineError::Store)
    }

    async fn charge_job(
        &self,
        job: &Job,
        input: &JobInput,
        attachment_ids: &[i64],
    ) -> Result<Option<DebitReceipt>, PipelineError> {
        if attachment_ids.is_empty() {
            return Ok(None);
        }
        let Some(user_id) = job_owner(job, input) else {
            info!("No member on job, not charging");
            return Ok(None);
        };

        let org_id = match non_blank(job.org_id.as_deref()) {
            Some(org_id) => Some(org_id.to_string()),
            None => match self.ledger.store().member_organization(user_id).await {
                Ok(org_id) => org_id,
                Err(err) => {
                    warn!(user_id, error = %err, "Organization lookup failed, charging member");
                    None
                }
            },
        };

        let actor = Actor {
            user_id: user_id.to_string(),
            org_id,
        };
        let charge = Charge {
            job_id: job.job_id.clone(),
            production_id: job.production_id.clone(),
            attachment_ids: attachment_ids.to_vec(),
        };
        let receipt = self
            .ledger
            .debit(&actor, &charge, self.settings.price_per_image)
            .await?;
        Ok(Some(receipt))
    }

    /// Single synchronous generation for the unified endpoints. Each
    /// reference goes to the model as its own part.
    #[instrument(skip(self, prompt, references), fields(references = references.len()))]
    pub async fn generate_once(
        &self,
        category: Category,
        prompt: &str,
        aspect_ratio: &str,
        references: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>, PipelineError> {
        let builder = category.prompt_builder();
        let roles = vec![ReferenceRole::Reference; references.len()];
        let text = builder.build(&PromptContext {
            user_prompt: prompt,
            aspect_ratio,
            roles: &roles,
            shot: None,
        });

        let mut parts = vec![Part::Text(text)];
        parts.extend(references.into_iter().map(Part::image));
        let config = GenerationConfig::image(aspect_ratio, builder.temperature());

        let response = self
            .retry
            .generate(
                &self.settings.credential,
                &self.settings.model,
                &Content { parts },
                &config,
            )
            .await?;
        Ok(response.first_image()?)
    }

    /// Debits one studio image outside the queue, under a fresh job id.
    pub async fn charge_single(
        &self,
        user_id: &str,
        attachment_id: i64,
    ) -> Result<DebitReceipt, PipelineError> {
        let org_id = match self.ledger.store().member_organization(user_id).await {
            Ok(org_id) => org_id,
            Err(err) => {
                warn!(user_id, error = %err, "Organization lookup failed, charging member");
                None
            }
        };
        let actor = Actor {
            user_id: user_id.to_string(),
            org_id,
        };
        let charge = Charge {
            job_id: format!("studio-{}", uuid::Uuid::new_v4()),
            production_id: None,
            attachment_ids: vec![attachment_id],
        };
        Ok(self
            .ledger
            .debit(&actor, &charge, self.settings.price_per_image)
            .await?)
    }

    /// Asks the model for a reusable prompt describing the image at `url`.
    #[instrument(skip(self))]
    pub async fn analyze(&self, image_url: &str, category: Category) -> Result<String, PipelineError> {
        let image = self
            .storage
            .fetch_url(image_url)
            .await
            .map_err(PipelineError::Storage)?;
        let content = Content {
            parts: vec![Part::Text(analyze_prompt(category)), Part::image(image)],
        };
        let response = self
            .retry
            .generate(
                &self.settings.credential,
                &self.settings.model,
                &content,
                &GenerationConfig::text(0.3),
            )
            .await?;
        response
            .first_text()
            .ok_or(PipelineError::Provider(ProviderError::NoCandidates))
    }
}

fn job_owner<'a>(job: &'a Job, input: &'a JobInput) -> Option<&'a str> {
    non_blank(job.member_id.as_deref()).or_else(|| input.user_id())
}
