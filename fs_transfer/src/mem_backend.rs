use crate::cancel::CancelToken;
use async_trait::async_trait;
use fvr_lib::{BackendAdapter, BackendError, BackendResult, RemoteId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory backend with knobs for injecting failures.
pub struct MemBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    reusable: bool,
    upload_calls: AtomicUsize,
    download_calls: AtomicUsize,
    uploaded: AtomicUsize,
    upload_faults: Mutex<VecDeque<BackendError>>,
    download_faults: Mutex<VecDeque<BackendError>>,
    // permanent failure once this many uploads have succeeded
    fail_uploads_after: Mutex<Option<usize>>,
    cancel_after: Mutex<Option<(usize, CancelToken)>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            reusable: true,
            upload_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            uploaded: AtomicUsize::new(0),
            upload_faults: Mutex::new(VecDeque::new()),
            download_faults: Mutex::new(VecDeque::new()),
            fail_uploads_after: Mutex::new(None),
            cancel_after: Mutex::new(None),
        }
    }

    pub fn new_non_reusable() -> Self {
        Self {
            reusable: false,
            ..Self::new()
        }
    }

    pub fn push_upload_fault(&self, err: BackendError) {
        self.upload_faults.lock().unwrap().push_back(err);
    }

    pub fn push_download_fault(&self, err: BackendError) {
        self.download_faults.lock().unwrap().push_back(err);
    }

    pub fn fail_uploads_after(&self, count: Option<usize>) {
        *self.fail_uploads_after.lock().unwrap() = count;
    }

    pub fn cancel_after(&self, count: usize, token: CancelToken) {
        *self.cancel_after.lock().unwrap() = Some((count, token));
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn corrupt(&self, remote_id: &str) {
        let mut objects = self.objects.lock().unwrap();
        let data = objects.get_mut(remote_id).unwrap();
        if data.is_empty() {
            data.push(0);
        } else {
            data[0] ^= 0xff;
        }
    }

    pub fn remove(&self, remote_id: &str) {
        self.objects.lock().unwrap().remove(remote_id);
    }
}

#[async_trait]
impl BackendAdapter for MemBackend {
    fn backend_name(&self) -> &str {
        "mem"
    }

    async fn upload(&self, data: &[u8]) -> BackendResult<RemoteId> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.upload_faults.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(limit) = *self.fail_uploads_after.lock().unwrap() {
            if self.uploaded() >= limit {
                return Err(BackendError::Permanent("quota exceeded".to_string()));
            }
        }

        let done = self.uploaded.fetch_add(1, Ordering::SeqCst) + 1;
        let remote_id = format!("mem-{}", done);
        self.objects
            .lock()
            .unwrap()
            .insert(remote_id.clone(), data.to_vec());

        if let Some((count, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if done >= *count {
                token.cancel();
            }
        }
        Ok(remote_id)
    }

    async fn download(&self, remote_id: &str) -> BackendResult<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.download_faults.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.objects
            .lock()
            .unwrap()
            .get(remote_id)
            .cloned()
            .ok_or_else(|| BackendError::Permanent(format!("no object {}", remote_id)))
    }

    fn reusable_remote_ids(&self) -> bool {
        self.reusable
    }
}
