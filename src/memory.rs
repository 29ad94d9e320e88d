//! In-memory imager that queues submitted jobs for rendering workers.
//!
//! Every job pairs one style image with one content image. `CreateJob`
//! fans a content image out to every loaded style; `CreateFullJob` brings
//! its own style. Workers move a job from pending to in progress with
//! `RequestJob`, and either finish it with `CompleteJob` or hand it back
//! with `FailJob`. Finished jobs are counted and their images released.
//! When an output directory is set, a job's images, progress renders and
//! result are written under `<output>/<name>/<id>/`.

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::service::{
    CreateFullJobRequest, CreateFullJobResponse, CreateJobRequest, CreateJobResponse,
    ImageFormat, ImagerError, ImagerHandler, InputImage, JobFail, JobFailResponse,
    JobProgressResponse, JobRequest, JobRequestResponse, JobResult, JobResultResponse,
    WorkerHandler, WorkerJob,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub style_name: String,
    pub style_image: Vec<u8>,
    pub content_image: Vec<u8>,
    pub content_format: ImageFormat,
    pub last_updated: SystemTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub styles: usize,
}

#[derive(Default)]
struct State {
    /// Keyed by submission order; a failed job goes to the back.
    pending: BTreeMap<u64, Job>,
    next_seq: u64,
    in_progress: HashMap<String, Job>,
    completed: usize,
    styles: BTreeMap<String, Vec<u8>>,
}

impl State {
    fn push_pending(&mut self, job: Job) {
        self.pending.insert(self.next_seq, job);
        self.next_seq += 1;
    }
}

#[derive(Default)]
pub struct MemoryImager {
    state: RwLock<State>,
    output_dir: Option<PathBuf>,
}

impl MemoryImager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Loads a style image from disk, naming it after the file stem.
    pub async fn load_style(&self, path: impl AsRef<Path>) -> io::Result<String> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no usable file name in {}", path.display()),
                )
            })?
            .to_string();
        let image = tokio::fs::read(path).await?;
        self.add_style(name.clone(), image).await;
        Ok(name)
    }

    pub async fn add_style(&self, name: impl Into<String>, image: Vec<u8>) {
        let name = name.into();
        info!(style = %name, bytes = image.len(), "loaded style");
        self.state.write().await.styles.insert(name, image);
    }

    pub async fn stats(&self) -> JobStats {
        let state = self.state.read().await;
        JobStats {
            pending: state.pending.len(),
            in_progress: state.in_progress.len(),
            completed: state.completed,
            styles: state.styles.len(),
        }
    }

    /// Pending jobs ordered by name, then style.
    pub async fn pending_jobs(&self) -> Vec<Job> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state.pending.values().cloned().collect();
        jobs.sort_by(|a, b| (&a.name, &a.style_name).cmp(&(&b.name, &b.style_name)));
        jobs
    }

    /// Jobs handed to workers and not yet completed or failed.
    pub async fn in_progress_jobs(&self) -> Vec<Job> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state.in_progress.values().cloned().collect();
        jobs.sort_by(|a, b| (&a.name, &a.style_name).cmp(&(&b.name, &b.style_name)));
        jobs
    }

    async fn enqueue(&self, jobs: Vec<Job>) {
        {
            let mut state = self.state.write().await;
            for job in &jobs {
                info!(id = %job.id, name = %job.name, style = %job.style_name, "added job");
                state.push_pending(job.clone());
            }
        }

        if let Some(dir) = &self.output_dir {
            for job in &jobs {
                if let Err(err) = persist(dir, job).await {
                    warn!(id = %job.id, "failed to store job images: {err}");
                }
            }
        }
    }
}

fn new_job(
    name: &str,
    style_name: &str,
    style_image: Vec<u8>,
    content_image: Vec<u8>,
    content_format: ImageFormat,
) -> Job {
    Job {
        id: Uuid::new_v4().simple().to_string(),
        name: name.to_string(),
        style_name: style_name.to_string(),
        style_image,
        content_image,
        content_format,
        last_updated: SystemTime::now(),
    }
}

/// Keeps a client-supplied name from escaping the output directory.
fn path_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn job_dir(dir: &Path, name: &str, id: &str) -> PathBuf {
    dir.join(path_segment(name)).join(path_segment(id))
}

async fn persist(dir: &Path, job: &Job) -> io::Result<()> {
    let job_dir = job_dir(dir, &job.name, &job.id);
    tokio::fs::create_dir_all(&job_dir).await?;

    let style_file = job_dir.join(format!("{}.jpg", path_segment(&job.style_name)));
    tokio::fs::write(style_file, &job.style_image).await?;

    let content_file = job_dir.join(format!(
        "{}.{}",
        path_segment(&job.name),
        job.content_format.extension()
    ));
    tokio::fs::write(content_file, &job.content_image).await
}

async fn store_render(dir: &Path, result: &JobResult, file_stem: &str) -> io::Result<()> {
    let job_dir = job_dir(dir, &result.name, &result.id);
    tokio::fs::create_dir_all(&job_dir).await?;
    let file = job_dir.join(format!("{file_stem}.{}", result.format.extension()));
    tokio::fs::write(file, &result.image).await
}

#[async_trait]
impl ImagerHandler for MemoryImager {
    async fn create_job(&self, request: CreateJobRequest) -> Result<CreateJobResponse, ImagerError> {
        if request.name.is_empty() {
            return Err(ImagerError::EmptyName);
        }
        if request.content.image.is_empty() {
            return Err(ImagerError::EmptyImage);
        }

        let jobs: Vec<Job> = {
            let state = self.state.read().await;
            state
                .styles
                .iter()
                .map(|(style_name, style)| {
                    new_job(
                        &request.name,
                        style_name,
                        style.clone(),
                        request.content.image.clone(),
                        request.content.format,
                    )
                })
                .collect()
        };
        if jobs.is_empty() {
            warn!(name = %request.name, "no styles loaded, job acknowledged without work");
        }

        self.enqueue(jobs).await;
        Ok(CreateJobResponse {})
    }

    async fn create_full_job(
        &self,
        request: CreateFullJobRequest,
    ) -> Result<CreateFullJobResponse, ImagerError> {
        if request.name.is_empty() {
            return Err(ImagerError::EmptyName);
        }
        if request.content.image.is_empty() {
            return Err(ImagerError::EmptyImage);
        }
        if request.style.image.is_empty() {
            return Err(ImagerError::EmptyStyle);
        }

        let job = new_job(
            &request.name,
            &request.style.title,
            request.style.image,
            request.content.image,
            request.content.format,
        );
        self.enqueue(vec![job]).await;
        Ok(CreateFullJobResponse {})
    }
}

#[async_trait]
impl WorkerHandler for MemoryImager {
    async fn request_job(&self, _: JobRequest) -> Result<JobRequestResponse, ImagerError> {
        let mut state = self.state.write().await;
        let Some((_, mut job)) = state.pending.pop_first() else {
            return Ok(JobRequestResponse { job: None });
        };

        job.last_updated = SystemTime::now();
        let assigned = WorkerJob {
            id: job.id.clone(),
            name: job.name.clone(),
            style: InputImage {
                title: job.style_name.clone(),
                format: ImageFormat::Jpg,
                image: job.style_image.clone(),
            },
            content: InputImage {
                title: job.name.clone(),
                format: job.content_format,
                image: job.content_image.clone(),
            },
        };
        info!(id = %job.id, name = %job.name, "job handed to worker");
        state.in_progress.insert(job.id.clone(), job);
        Ok(JobRequestResponse {
            job: Some(assigned),
        })
    }

    async fn progress_report(&self, result: JobResult) -> Result<JobProgressResponse, ImagerError> {
        {
            let mut state = self.state.write().await;
            let job = state
                .in_progress
                .get_mut(&result.id)
                .filter(|job| job.name == result.name)
                .ok_or_else(|| ImagerError::UnknownJob(result.id.clone()))?;
            job.last_updated = SystemTime::now();
        }
        info!(id = %result.id, name = %result.name, iterations = result.progress_count, "progress received");

        if let Some(dir) = &self.output_dir {
            let stem = format!("result_{}", result.progress_count);
            if let Err(err) = store_render(dir, &result, &stem).await {
                warn!(id = %result.id, "failed to store progress image: {err}");
            }
        }
        Ok(JobProgressResponse {})
    }

    async fn complete_job(&self, result: JobResult) -> Result<JobResultResponse, ImagerError> {
        {
            let mut state = self.state.write().await;
            match state.in_progress.get(&result.id) {
                Some(job) if job.name == result.name => {}
                _ => return Err(ImagerError::UnknownJob(result.id.clone())),
            }
            state.in_progress.remove(&result.id);
            state.completed += 1;
        }
        info!(id = %result.id, name = %result.name, "job completed");

        if let Some(dir) = &self.output_dir {
            if let Err(err) = store_render(dir, &result, "result").await {
                warn!(id = %result.id, "failed to store result image: {err}");
            }
        }
        Ok(JobResultResponse {})
    }

    async fn fail_job(&self, fail: JobFail) -> Result<JobFailResponse, ImagerError> {
        let mut state = self.state.write().await;
        let mut job = match state.in_progress.remove(&fail.id) {
            Some(job) if job.name == fail.name => job,
            Some(job) => {
                state.in_progress.insert(fail.id.clone(), job);
                return Err(ImagerError::UnknownJob(fail.id));
            }
            None => return Err(ImagerError::UnknownJob(fail.id)),
        };
        job.last_updated = SystemTime::now();
        warn!(id = %job.id, name = %job.name, "job failed, back to pending");
        state.push_pending(job);
        Ok(JobFailResponse {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create(name: &str, image: Vec<u8>) -> CreateJobRequest {
        CreateJobRequest {
            name: name.into(),
            content: InputImage::jpg(image),
        }
    }

    #[tokio::test]
    async fn create_job_fans_out_to_every_style() {
        let imager = MemoryImager::new();
        imager.add_style("mosaic", vec![1]).await;
        imager.add_style("scream", vec![2]).await;

        imager.create_job(create("sunset", vec![0xFF, 0xD8])).await.unwrap();

        let jobs = imager.pending_jobs().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].style_name, "mosaic");
        assert_eq!(jobs[1].style_name, "scream");
        assert!(jobs.iter().all(|job| job.content_image == [0xFF, 0xD8]));
        assert_ne!(jobs[0].id, jobs[1].id);
        assert_eq!(jobs[0].id.len(), 32);
    }

    #[tokio::test]
    async fn create_job_without_styles_is_acknowledged() {
        let imager = MemoryImager::new();
        imager.create_job(create("sunset", vec![1])).await.unwrap();
        assert_eq!(imager.stats().await, JobStats::default());
    }

    #[tokio::test]
    async fn empty_submissions_are_rejected() {
        let imager = MemoryImager::new();
        assert_eq!(
            imager.create_job(create("sunset", vec![])).await,
            Err(ImagerError::EmptyImage)
        );
        assert_eq!(
            imager.create_job(create("", vec![1])).await,
            Err(ImagerError::EmptyName)
        );
    }

    #[tokio::test]
    async fn full_job_uses_supplied_style() {
        let imager = MemoryImager::new();
        imager.add_style("ignored", vec![9]).await;

        imager
            .create_full_job(CreateFullJobRequest {
                name: "sunset".into(),
                style: InputImage::jpg(vec![7]).with_title("starry"),
                content: InputImage::jpg(vec![1]).with_title("sunset"),
            })
            .await
            .unwrap();

        let jobs = imager.pending_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].style_name, "starry");
        assert_eq!(jobs[0].style_image, vec![7]);
    }

    #[tokio::test]
    async fn load_style_names_style_after_file_stem() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wave.jpg");
        std::fs::write(&path, [1, 2, 3]).unwrap();

        let imager = MemoryImager::new();
        let name = imager.load_style(&path).await.unwrap();

        assert_eq!(name, "wave");
        assert_eq!(imager.stats().await.styles, 1);
    }

    #[tokio::test]
    async fn output_dir_receives_job_images() {
        let tmp = TempDir::new().unwrap();
        let imager = MemoryImager::new().with_output_dir(tmp.path());
        imager.add_style("wave", vec![5, 5]).await;

        imager.create_job(create("../sunset", vec![0xFF, 0xD8])).await.unwrap();

        let job = &imager.pending_jobs().await[0];
        let job_dir = tmp.path().join(".._sunset").join(&job.id);
        assert_eq!(std::fs::read(job_dir.join("wave.jpg")).unwrap(), vec![5, 5]);
        assert_eq!(std::fs::read(job_dir.join(".._sunset.jpg")).unwrap(), vec![0xFF, 0xD8]);
    }

    fn result(job: &WorkerJob, progress_count: u32) -> JobResult {
        JobResult {
            id: job.id.clone(),
            name: job.name.clone(),
            progress_count,
            format: ImageFormat::Png,
            image: vec![0x89, b'P', b'N', b'G'],
        }
    }

    #[tokio::test]
    async fn worker_takes_jobs_oldest_first() {
        let imager = MemoryImager::new();
        imager.add_style("wave", vec![5]).await;
        imager.create_job(create("first", vec![1])).await.unwrap();
        imager.create_job(create("second", vec![2])).await.unwrap();

        let job = imager.request_job(JobRequest {}).await.unwrap().job.unwrap();

        assert_eq!(job.name, "first");
        assert_eq!(job.style.title, "wave");
        assert_eq!(job.style.image, vec![5]);
        assert_eq!(job.content.image, vec![1]);
        assert_eq!(
            imager.stats().await,
            JobStats { pending: 1, in_progress: 1, completed: 0, styles: 1 }
        );
    }

    #[tokio::test]
    async fn empty_queue_hands_out_nothing() {
        let imager = MemoryImager::new();
        assert_eq!(imager.request_job(JobRequest {}).await.unwrap().job, None);
    }

    #[tokio::test]
    async fn completed_jobs_release_their_images() {
        let imager = MemoryImager::new();
        imager.add_style("wave", vec![5]).await;
        imager.create_job(create("sunset", vec![1])).await.unwrap();
        let job = imager.request_job(JobRequest {}).await.unwrap().job.unwrap();

        imager.progress_report(result(&job, 100)).await.unwrap();
        imager.complete_job(result(&job, 500)).await.unwrap();

        assert!(imager.pending_jobs().await.is_empty());
        assert!(imager.in_progress_jobs().await.is_empty());
        assert_eq!(imager.stats().await.completed, 1);
        assert_eq!(
            imager.complete_job(result(&job, 500)).await,
            Err(ImagerError::UnknownJob(job.id.clone()))
        );
    }

    #[tokio::test]
    async fn failed_job_returns_to_pending() {
        let imager = MemoryImager::new();
        imager.add_style("wave", vec![5]).await;
        imager.create_job(create("sunset", vec![1])).await.unwrap();
        let job = imager.request_job(JobRequest {}).await.unwrap().job.unwrap();

        let wrong_name = JobFail { id: job.id.clone(), name: "other".into() };
        assert!(imager.fail_job(wrong_name).await.is_err());
        imager
            .fail_job(JobFail { id: job.id.clone(), name: job.name.clone() })
            .await
            .unwrap();

        assert_eq!(imager.pending_jobs().await[0].id, job.id);
        assert_eq!(imager.stats().await.in_progress, 0);
    }

    #[tokio::test]
    async fn progress_for_unknown_job_is_rejected() {
        let imager = MemoryImager::new();
        let job = WorkerJob {
            id: "missing".into(),
            name: "sunset".into(),
            style: InputImage::jpg(vec![1]),
            content: InputImage::jpg(vec![2]),
        };
        assert_eq!(
            imager.progress_report(result(&job, 100)).await,
            Err(ImagerError::UnknownJob("missing".into()))
        );
    }

    #[tokio::test]
    async fn renders_land_in_the_job_directory() {
        let tmp = TempDir::new().unwrap();
        let imager = MemoryImager::new().with_output_dir(tmp.path());
        imager.add_style("wave", vec![5]).await;
        imager.create_job(create("sunset", vec![1])).await.unwrap();
        let job = imager.request_job(JobRequest {}).await.unwrap().job.unwrap();

        imager.progress_report(result(&job, 100)).await.unwrap();
        imager.complete_job(result(&job, 500)).await.unwrap();

        let job_dir = tmp.path().join("sunset").join(&job.id);
        assert!(job_dir.join("result_100.png").is_file());
        assert!(job_dir.join("result.png").is_file());
    }

    #[test]
    fn path_segment_neutralises_traversal() {
        assert_eq!(path_segment(".."), "_");
        assert_eq!(path_segment("a/b"), "a_b");
        assert_eq!(path_segment("sunset"), "sunset");
    }
}
