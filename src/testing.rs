//! In-memory fakes for the storage, queue and provider seams.

use crate::cancel::CancellationStore;
use crate::flags::EphemeralStore;
use crate::gemini::{Content, GenerateResponse, GenerationConfig, ImageGenerator, Part, ProviderError};
use crate::ledger::CreditLedger;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::queue::WorkQueue;
use crate::retry::{RetryClient, RetryPolicy};
use crate::storage::ObjectStorage;
use crate::store::{merge_attachment_ids, BatchDebit, JobStore, LedgerStore};
use crate::{Account, Attachment, CreditTransaction, Job, NewAttachment, Status};
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use image::{ImageFormat, Rgba, RgbaImage};
use sqlx::types::Json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn solid_png(width: u32, height: u32, color: Rgba<u8>) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, color);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    solid_png(width, height, Rgba([120, 80, 40, 255]))
}

pub fn data_url(bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Pending job owned by member `u1`.
pub fn job(job_id: &str, route: &str, total_images: i32, input: serde_json::Value) -> Job {
    Job {
        job_id: job_id.into(),
        job_type: "simple_general".into(),
        route: route.into(),
        status: Status::Pending,
        total_images,
        completed_images: 0,
        generated_attachment_ids: vec![],
        production_id: None,
        member_id: Some("u1".into()),
        org_id: None,
        input: Json(input),
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

#[derive(Default)]
pub struct MemoryFlags {
    entries: Mutex<HashMap<String, (String, Duration)>>,
}

impl MemoryFlags {
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries.lock().unwrap().get(key).map(|(_, ttl)| *ttl)
    }
}

#[async_trait]
impl EphemeralStore for MemoryFlags {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, Job>,
    attachments: HashMap<i64, Attachment>,
    next_attachment: i64,
    productions: HashMap<String, (Status, Vec<i64>)>,
    members: HashMap<String, i64>,
    organizations: HashMap<String, (String, i64)>,
    memberships: HashMap<String, String>,
    transactions: Vec<CreditTransaction>,
    charges: HashSet<(String, i64)>,
    balance_writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_transactions: AtomicBool,
}

impl MemoryStore {
    pub fn insert_job(&self, job: Job) {
        self.tables.lock().unwrap().jobs.insert(job.job_id.clone(), job);
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.tables.lock().unwrap().jobs.get(job_id).cloned()
    }

    pub fn insert_attachment(&self, file_path: &str) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        tables.next_attachment += 1;
        let id = tables.next_attachment;
        tables.attachments.insert(
            id,
            Attachment {
                id,
                file_name: file_path.rsplit('/').next().unwrap_or(file_path).into(),
                file_path: file_path.into(),
                file_size: 0,
                mime_type: "image/png".into(),
                storage_type: "supabase".into(),
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn insert_production(&self, production_id: &str) {
        self.tables
            .lock()
            .unwrap()
            .productions
            .insert(production_id.into(), (Status::Pending, vec![]));
    }

    pub fn production(&self, production_id: &str) -> Option<(Status, Vec<i64>)> {
        self.tables.lock().unwrap().productions.get(production_id).cloned()
    }

    pub fn set_member_credit(&self, member_id: &str, credit: i64) {
        self.tables.lock().unwrap().members.insert(member_id.into(), credit);
    }

    pub fn member_credit(&self, member_id: &str) -> Option<i64> {
        self.tables.lock().unwrap().members.get(member_id).copied()
    }

    pub fn set_organization(&self, org_id: &str, status: &str, credit: i64) {
        self.tables
            .lock()
            .unwrap()
            .organizations
            .insert(org_id.into(), (status.into(), credit));
    }

    pub fn organization_credit(&self, org_id: &str) -> Option<i64> {
        self.tables
            .lock()
            .unwrap()
            .organizations
            .get(org_id)
            .map(|(_, credit)| *credit)
    }

    pub fn join_organization(&self, member_id: &str, org_id: &str) {
        self.tables
            .lock()
            .unwrap()
            .memberships
            .insert(member_id.into(), org_id.into());
    }

    pub fn transactions(&self) -> Vec<CreditTransaction> {
        self.tables.lock().unwrap().transactions.clone()
    }

    pub fn balance_writes(&self) -> usize {
        self.tables.lock().unwrap().balance_writes
    }

    pub fn fail_transactions(&self, fail: bool) {
        self.fail_transactions.store(fail, Ordering::SeqCst);
    }

    fn set_terminal(&self, job_id: &str, status: Status, msg: Option<&str>) -> bool {
        let mut tables = self.tables.lock().unwrap();
        match tables.jobs.get_mut(job_id) {
            Some(job) if job.status.can_transition_to(status) => {
                job.status = status;
                job.error_message = msg.map(Into::into);
                job.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn fetch_job(&self, job_id: &str) -> Result<Option<Job>, Error> {
        Ok(self.job(job_id))
    }

    async fn claim_job(&self, job_id: &str, resume: bool) -> Result<bool, Error> {
        let mut tables = self.tables.lock().unwrap();
        match tables.jobs.get_mut(job_id) {
            Some(job)
                if job.status == Status::Pending
                    || (resume && job.status == Status::Processing) =>
            {
                job.status = Status::Processing;
                job.started_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_job(&self, job_id: &str) -> Result<bool, Error> {
        let mut tables = self.tables.lock().unwrap();
        match tables.jobs.get_mut(job_id) {
            Some(job) if job.status == Status::Processing => {
                job.status = Status::Pending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        job_id: &str,
        completed_images: i32,
        attachment_ids: &[i64],
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        let job = tables
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow!("unknown job {job_id}"))?;
        job.completed_images = completed_images.min(job.total_images);
        job.generated_attachment_ids = merge_attachment_ids(&[], attachment_ids);
        Ok(())
    }

    async fn finish_job(&self, job_id: &str, status: Status) -> Result<bool, Error> {
        Ok(self.set_terminal(job_id, status, None))
    }

    async fn fail_job(&self, job_id: &str, msg: &str) -> Result<bool, Error> {
        Ok(self.set_terminal(job_id, Status::Failed, Some(msg)))
    }

    async fn processing_job_ids(&self) -> Result<Vec<String>, Error> {
        let tables = self.tables.lock().unwrap();
        let mut ids: Vec<_> = tables
            .jobs
            .values()
            .filter(|job| job.status == Status::Processing)
            .map(|job| job.job_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn create_attachment(&self, attachment: &NewAttachment) -> Result<Attachment, Error> {
        let id = self.insert_attachment(&attachment.file_path);
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .attachments
            .get_mut(&id)
            .ok_or_else(|| anyhow!("attachment {id} vanished"))?;
        row.file_size = attachment.file_size;
        row.mime_type = attachment.mime_type.clone();
        Ok(row.clone())
    }

    async fn fetch_attachment(&self, id: i64) -> Result<Option<Attachment>, Error> {
        Ok(self.tables.lock().unwrap().attachments.get(&id).cloned())
    }

    async fn update_production(
        &self,
        production_id: &str,
        status: Status,
        attachment_ids: &[i64],
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .productions
            .get_mut(production_id)
            .ok_or_else(|| anyhow!("unknown production {production_id}"))?;
        row.0 = status;
        row.1 = merge_attachment_ids(&row.1, attachment_ids);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn organization_status(&self, org_id: &str) -> Result<Option<String>, Error> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .organizations
            .get(org_id)
            .map(|(status, _)| status.clone()))
    }

    async fn member_organization(&self, member_id: &str) -> Result<Option<String>, Error> {
        Ok(self.tables.lock().unwrap().memberships.get(member_id).cloned())
    }

    async fn balance(&self, account: &Account) -> Result<i64, Error> {
        let tables = self.tables.lock().unwrap();
        let credit = match account {
            Account::Member(id) => tables.members.get(id).copied(),
            Account::Organization(id) => tables.organizations.get(id).map(|(_, c)| *c),
        };
        credit.ok_or_else(|| anyhow!("no balance for {account:?}"))
    }

    async fn debit_batch(
        &self,
        account: &Account,
        job_id: &str,
        attachment_ids: &[i64],
        price: i64,
    ) -> Result<BatchDebit, Error> {
        let mut tables = self.tables.lock().unwrap();
        let known = match account {
            Account::Member(id) => tables.members.contains_key(id),
            Account::Organization(id) => tables.organizations.contains_key(id),
        };
        if !known {
            return Err(anyhow!("no balance for {account:?}"));
        }

        let charged: Vec<i64> = attachment_ids
            .iter()
            .copied()
            .filter(|id| tables.charges.insert((job_id.to_string(), *id)))
            .collect();
        if charged.is_empty() {
            return Ok(BatchDebit {
                charged,
                balance_after: None,
            });
        }

        let amount = charged.len() as i64 * price;
        let credit = match account {
            Account::Member(id) => tables.members.get_mut(id),
            Account::Organization(id) => tables.organizations.get_mut(id).map(|(_, c)| c),
        }
        .ok_or_else(|| anyhow!("no balance for {account:?}"))?;
        *credit -= amount;
        let balance_after = Some(*credit);
        tables.balance_writes += 1;
        Ok(BatchDebit {
            charged,
            balance_after,
        })
    }

    async fn append_transaction(&self, transaction: &CreditTransaction) -> Result<(), Error> {
        if self.fail_transactions.load(Ordering::SeqCst) {
            return Err(anyhow!("transaction log unavailable"));
        }
        self.tables.lock().unwrap().transactions.push(transaction.clone());
        Ok(())
    }
}

/// FIFO in memory. `pop` on an empty queue waits briefly, then yields `None`.
pub struct MemoryQueue {
    name: String,
    items: Mutex<VecDeque<String>>,
}

impl MemoryQueue {
    pub fn new(name: &str) -> Self {
        MemoryQueue {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn items(&self) -> Vec<String> {
        self.items.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, job_id: &str) -> Result<i64, Error> {
        let mut items = self.items.lock().unwrap();
        items.push_back(job_id.into());
        Ok(items.len() as i64)
    }

    async fn requeue(&self, job_id: &str) -> Result<(), Error> {
        self.items.lock().unwrap().push_front(job_id.into());
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, Error> {
        let popped = self.items.lock().unwrap().pop_front();
        if popped.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(popped)
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploaded: Mutex<Vec<String>>,
    fail_uploads: AtomicBool,
}

impl MemoryStorage {
    pub fn put(&self, path: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(path.into(), bytes);
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn download(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(&crate::storage::resolve_path(path))
            .cloned()
            .ok_or_else(|| anyhow!("no object at {path}"))
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), Error> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        self.put(path, bytes);
        self.uploaded.lock().unwrap().push(path.into());
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("mem://{path}")
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, Error> {
        self.download(url.trim_start_matches("mem://")).await
    }
}

/// Replays canned provider results, then repeats `fallback` if set.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GenerateResponse, ProviderError>>>,
    fallback: Option<GenerateResponse>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<Content>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<GenerateResponse, ProviderError>>) -> Self {
        ScriptedGenerator {
            script: Mutex::new(script.into()),
            fallback: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(response: GenerateResponse) -> Self {
        ScriptedGenerator {
            fallback: Some(response),
            ..ScriptedGenerator::new(vec![])
        }
    }

    /// Every call takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn image_response(data: Vec<u8>) -> GenerateResponse {
        GenerateResponse {
            candidates: vec![vec![Part::Image {
                mime_type: "image/png".into(),
                data,
            }]],
        }
    }

    pub fn text_response(text: &str) -> GenerateResponse {
        GenerateResponse {
            candidates: vec![vec![Part::Text(text.into())]],
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Content> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _credential: &str,
        _model: &str,
        content: &Content,
        _config: &GenerationConfig,
    ) -> Result<GenerateResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(content.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => self.fallback.clone().ok_or(ProviderError::NoCandidates),
        }
    }
}

/// Pipeline over the in-memory fakes, with a near-zero retry delay.
pub fn pipeline(
    store: Arc<MemoryStore>,
    storage: Arc<MemoryStorage>,
    flags: Arc<MemoryFlags>,
    generator: Arc<dyn ImageGenerator>,
) -> Pipeline {
    let retry = RetryClient::new(
        generator,
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        },
    );
    Pipeline::new(
        store.clone(),
        CreditLedger::new(store, "gemini"),
        storage,
        CancellationStore::new(flags),
        retry,
        PipelineSettings {
            credential: "key".into(),
            model: "model".into(),
            price_per_image: 5,
        },
    )
}
