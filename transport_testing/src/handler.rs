//! A business handler whose answers tests choose and whose calls tests
//! inspect.

use std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use shuffle_transport::{
    BoxError,
    PushData,
    PushMergedData,
    RpcHandler,
    RpcResponseCallback,
    SharedError,
    StreamCallback,
    StreamCallbackWithId,
    StreamManager,
    TransportClient,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How [`ScriptedHandler`] answers RPCs.
#[derive(Clone, Debug)]
pub enum RpcScript {
    /// Reply with the request body.
    Echo,
    /// Reply with fixed bytes.
    Reply(Bytes),
    /// Return an error with this message.
    Fail(String),
    /// Panic with this message.
    Panic(String),
}

/// How [`ScriptedHandler`] treats uploads.
#[derive(Clone, Debug)]
pub enum UploadScript {
    /// Record the body and succeed.
    Accept,
    /// Record the body, then fail post-processing with this message.
    FailOnComplete(String),
    /// Refuse the upload with this message.
    Reject(String),
}

/// How [`ScriptedHandler`] answers pushes.
#[derive(Clone, Debug)]
pub enum PushScript {
    /// Record the partitions and acknowledge with an empty body.
    Ack,
    /// Record the partitions, then report this failure through the callback.
    Fail(String),
}

/// Connection lifecycle notifications observed by the handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Active,
    Inactive,
    Exception(String),
}

/// What the handler saw of one upload.
#[derive(Clone, Debug, Default)]
pub struct RecordedUpload {
    pub id: String,
    pub meta: Bytes,
    pub data: Vec<u8>,
    pub completed: bool,
    pub failure: Option<String>,
}

/// Handler with scripted answers and recorded calls.
pub struct ScriptedHandler {
    streams: Arc<dyn StreamManager>,
    registered: AtomicBool,
    client_id: Option<String>,
    rpc: Mutex<RpcScript>,
    upload: Mutex<UploadScript>,
    push: Mutex<PushScript>,
    one_way: Mutex<Vec<Bytes>>,
    pushes: Mutex<Vec<String>>,
    uploads: Arc<Mutex<Vec<RecordedUpload>>>,
    events: Mutex<Vec<ChannelEvent>>,
    next_upload: AtomicU64,
}

impl ScriptedHandler {
    /// Echo RPCs, accept uploads and serve fetches from `streams`.
    #[must_use]
    pub fn new(streams: Arc<dyn StreamManager>) -> Self {
        Self {
            streams,
            registered: AtomicBool::new(true),
            client_id: None,
            rpc: Mutex::new(RpcScript::Echo),
            upload: Mutex::new(UploadScript::Accept),
            push: Mutex::new(PushScript::Ack),
            one_way: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            uploads: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(Vec::new()),
            next_upload: AtomicU64::new(1),
        }
    }

    /// Set the registration state reported to the dispatcher.
    #[must_use]
    pub fn with_registered(self, registered: bool) -> Self {
        self.registered.store(registered, Ordering::SeqCst);
        self
    }

    /// Assign `client_id` to every connection as it becomes active.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Answer RPCs as `script` says.
    #[must_use]
    pub fn with_rpc(self, script: RpcScript) -> Self {
        self.set_rpc(script);
        self
    }

    /// Treat uploads as `script` says.
    #[must_use]
    pub fn with_upload(self, script: UploadScript) -> Self {
        *lock(&self.upload) = script;
        self
    }

    /// Answer pushes as `script` says.
    #[must_use]
    pub fn with_push(self, script: PushScript) -> Self {
        *lock(&self.push) = script;
        self
    }

    /// Change how later RPCs are answered.
    pub fn set_rpc(&self, script: RpcScript) { *lock(&self.rpc) = script; }

    /// Bodies of one-way messages received so far.
    #[must_use]
    pub fn one_way_messages(&self) -> Vec<Bytes> { lock(&self.one_way).clone() }

    /// Partition ids of pushes received so far, in arrival order.
    #[must_use]
    pub fn pushed_partitions(&self) -> Vec<String> { lock(&self.pushes).clone() }

    /// Uploads seen so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<RecordedUpload> { lock(&self.uploads).clone() }

    /// Lifecycle notifications seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<ChannelEvent> { lock(&self.events).clone() }

    /// Wait up to one second for a matching lifecycle notification.
    pub async fn wait_for_event(&self, matches: impl Fn(&ChannelEvent) -> bool) -> bool {
        for _ in 0..200 {
            if self.events().iter().any(&matches) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn record(&self, event: ChannelEvent) { lock(&self.events).push(event); }

    fn answer_push(&self, callback: &dyn RpcResponseCallback) {
        match lock(&self.push).clone() {
            PushScript::Ack => callback.on_success(Bytes::new()),
            PushScript::Fail(msg) => callback.on_failure(SharedError::from(BoxError::from(msg))),
        }
    }
}

impl RpcHandler for ScriptedHandler {
    fn receive(
        &self,
        _client: &TransportClient,
        message: Bytes,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError> {
        let script = lock(&self.rpc).clone();
        match script {
            RpcScript::Echo => callback.on_success(message),
            RpcScript::Reply(reply) => callback.on_success(reply),
            RpcScript::Fail(msg) => return Err(msg.into()),
            RpcScript::Panic(msg) => panic!("{msg}"),
        }
        Ok(())
    }

    fn receive_one_way(&self, _client: &TransportClient, message: Bytes) -> Result<(), BoxError> {
        lock(&self.one_way).push(message);
        Ok(())
    }

    fn receive_stream(
        &self,
        _client: &TransportClient,
        meta: Bytes,
        _callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<Option<Box<dyn StreamCallbackWithId>>, BoxError> {
        let script = lock(&self.upload).clone();
        let fail_on_complete = match script {
            UploadScript::Reject(msg) => return Err(msg.into()),
            UploadScript::Accept => None,
            UploadScript::FailOnComplete(msg) => Some(msg),
        };
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        let index = {
            let mut uploads = lock(&self.uploads);
            uploads.push(RecordedUpload {
                id: id.clone(),
                meta,
                ..RecordedUpload::default()
            });
            uploads.len() - 1
        };
        Ok(Some(Box::new(RecordingUpload {
            id,
            index,
            uploads: Arc::clone(&self.uploads),
            fail_on_complete,
        })))
    }

    fn receive_push_data(
        &self,
        _client: &TransportClient,
        request: &PushData,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError> {
        lock(&self.pushes).push(request.partition_unique_id.clone());
        self.answer_push(&*callback);
        Ok(())
    }

    fn receive_push_merged_data(
        &self,
        _client: &TransportClient,
        request: &PushMergedData,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<(), BoxError> {
        lock(&self.pushes).extend(request.partition_unique_ids.iter().cloned());
        self.answer_push(&*callback);
        Ok(())
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> { Arc::clone(&self.streams) }

    fn check_registered(&self) -> bool { self.registered.load(Ordering::SeqCst) }

    fn channel_active(&self, client: &TransportClient) {
        if let Some(id) = &self.client_id {
            client.set_client_id(id.clone());
        }
        self.record(ChannelEvent::Active);
    }

    fn channel_inactive(&self, _client: &TransportClient) { self.record(ChannelEvent::Inactive); }

    fn exception_caught(&self, cause: &SharedError, _client: &TransportClient) {
        self.record(ChannelEvent::Exception(cause.to_string()));
    }
}

struct RecordingUpload {
    id: String,
    index: usize,
    uploads: Arc<Mutex<Vec<RecordedUpload>>>,
    fail_on_complete: Option<String>,
}

impl RecordingUpload {
    fn update(&self, f: impl FnOnce(&mut RecordedUpload)) {
        if let Some(upload) = lock(&self.uploads).get_mut(self.index) {
            f(upload);
        }
    }
}

impl StreamCallback for RecordingUpload {
    fn on_data(&mut self, _stream_id: &str, buf: Bytes) -> Result<(), BoxError> {
        self.update(|upload| upload.data.extend_from_slice(&buf));
        Ok(())
    }

    fn on_complete(&mut self, _stream_id: &str) -> Result<(), BoxError> {
        self.update(|upload| upload.completed = true);
        match &self.fail_on_complete {
            Some(msg) => Err(msg.clone().into()),
            None => Ok(()),
        }
    }

    fn on_failure(&mut self, _stream_id: &str, cause: SharedError) -> Result<(), BoxError> {
        self.update(|upload| upload.failure = Some(cause.to_string()));
        Ok(())
    }
}

impl StreamCallbackWithId for RecordingUpload {
    fn id(&self) -> String { self.id.clone() }
}
