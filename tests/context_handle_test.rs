use offload::config::{ContextConfig, RpcConfig};
use offload::context::{
    collaborator_factory, Collaborator, CollaboratorError, CollaboratorResult, ContextFault,
    ContextState, ExecutionContextHandle,
};
use offload::protocol::{
    CropParams, FlipDirection, FlipParams, ImagePayload, Operation, QualityParams, RotateAngle,
    RotateParams,
};
use offload::rpc::RpcError;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Test collaborator:
/// crop copies the rectangle, horizontal flip is slow, vertical flip panics and
/// jpeg compression always fails.
struct Scripted {
    init_delay: Duration,
    fail_init: bool,
}

impl Collaborator for Scripted {
    fn initialize(&mut self) -> CollaboratorResult<()> {
        std::thread::sleep(self.init_delay);
        if self.fail_init {
            return Err(CollaboratorError::failed("model weights missing"));
        }
        Ok(())
    }

    fn crop(
        &mut self,
        input: &[u8],
        width: u32,
        _height: u32,
        params: &CropParams,
        output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        let row = params.width as usize * 4;
        for y in 0..params.height as usize {
            let src = ((params.y as usize + y) * width as usize + params.x as usize) * 4;
            output[y * row..(y + 1) * row].copy_from_slice(&input[src..src + row]);
        }
        Ok(row * params.height as usize)
    }

    fn flip(
        &mut self,
        input: &[u8],
        _width: u32,
        _height: u32,
        params: &FlipParams,
        output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        match params.direction {
            FlipDirection::Horizontal => {
                std::thread::sleep(Duration::from_millis(300));
                output.copy_from_slice(input);
                Ok(output.len())
            }
            FlipDirection::Vertical => panic!("flip kernel crashed"),
        }
    }

    fn compress_jpeg(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &QualityParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::failed("encoder out of memory"))
    }
}

struct Fixture {
    builds: Arc<AtomicUsize>,
    handle: ExecutionContextHandle,
}

fn fixture(init_delay: Duration, fail_init: bool) -> Fixture {
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let factory = collaborator_factory(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Scripted {
            init_delay,
            fail_init,
        }
    });
    let handle = ExecutionContextHandle::new("test-context", factory)
        .with_context_config(ContextConfig::default().with_init_timeout(Duration::from_secs(2)))
        .with_rpc_config(RpcConfig::default().with_default_timeout(Duration::from_secs(2)));
    Fixture { builds, handle }
}

fn ready() -> Fixture {
    fixture(Duration::ZERO, false)
}

fn image() -> ImagePayload {
    let data: Vec<u8> = (0..4 * 4 * 4).map(|b| b as u8).collect();
    ImagePayload::new(data, 4, 4)
}

fn crop() -> Operation {
    Operation::Crop(CropParams {
        x: 1,
        y: 1,
        width: 2,
        height: 2,
    })
}

fn slow_flip() -> Operation {
    Operation::Flip(FlipParams {
        direction: FlipDirection::Horizontal,
    })
}

fn crashing_flip() -> Operation {
    Operation::Flip(FlipParams {
        direction: FlipDirection::Vertical,
    })
}

#[tokio::test]
async fn test_initialize_then_send() {
    let Fixture { handle, .. } = ready();
    assert_eq!(handle.state(), ContextState::Uninitialized);

    handle.initialize().await.unwrap();
    assert_eq!(handle.state(), ContextState::Ready);

    let result = handle.send(crop(), image()).await.unwrap();
    assert_eq!((result.width, result.height), (2, 2));
    // Rows 1 and 2, columns 1 and 2 of a 4x4 image whose bytes count up from zero.
    let expected: Vec<u8> = (20..28).chain(36..44).collect();
    assert_eq!(result.data.to_vec(), expected);
    assert_eq!(handle.state(), ContextState::Ready);
    assert_eq!(handle.pending_requests(), 0);
}

#[tokio::test]
async fn test_unsupported_operation_is_remote_error() {
    let Fixture { handle, .. } = ready();
    handle.initialize().await.unwrap();

    let rotate = Operation::Rotate(RotateParams {
        angle: RotateAngle::Degree90,
    });
    let err = handle.send(rotate, image()).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::RemoteError("Operation 'rotate' is not supported by this collaborator".into())
    );
    assert_eq!(handle.state(), ContextState::Ready);
}

#[tokio::test]
async fn test_send_before_initialize_not_ready() {
    let Fixture { handle, builds } = ready();
    let err = handle.send(crop(), image()).await.unwrap_err();
    assert!(matches!(err, RpcError::ChannelNotReady { .. }));
    assert_eq!(builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_initialization_failure_is_kept() {
    let Fixture { handle, builds } = fixture(Duration::ZERO, true);

    let err = handle.initialize().await.unwrap_err();
    assert_eq!(
        err,
        RpcError::InitializationFailure("model weights missing".to_string())
    );
    assert_eq!(handle.state(), ContextState::Errored);
    assert_eq!(
        handle.fault(),
        Some(ContextFault::Initialization("model weights missing".to_string()))
    );

    // Neither a send nor a second initialize spawns another context.
    assert!(matches!(
        handle.send(crop(), image()).await,
        Err(RpcError::InitializationFailure(_))
    ));
    assert!(matches!(
        handle.initialize().await,
        Err(RpcError::InitializationFailure(_))
    ));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initialization_timeout() {
    let handle = ExecutionContextHandle::new(
        "sluggish",
        collaborator_factory(|| Scripted {
            init_delay: Duration::from_millis(500),
            fail_init: false,
        }),
    )
    .with_context_config(ContextConfig::default().with_init_timeout(Duration::from_millis(50)));

    let err = handle.initialize().await.unwrap_err();
    assert!(matches!(err, RpcError::InitializationFailure(ref cause) if cause.contains("timed out")));
    assert_eq!(handle.state(), ContextState::Errored);
}

#[tokio::test]
async fn test_concurrent_initialize_spawns_one_context() {
    let Fixture { handle, builds } = fixture(Duration::from_millis(50), false);

    let (a, b, c) = tokio::join!(handle.initialize(), handle.initialize(), handle.initialize());

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), ContextState::Ready);
}

#[tokio::test]
async fn test_second_send_while_busy_rejected() {
    let Fixture { handle, .. } = ready();
    handle.initialize().await.unwrap();

    let (slow, second) = tokio::join!(handle.send(slow_flip(), image()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), ContextState::Busy);
        handle.send(crop(), image()).await
    });

    assert!(slow.is_ok());
    assert!(matches!(second, Err(RpcError::ChannelBusy { .. })));
    assert_eq!(handle.state(), ContextState::Ready);
}

#[tokio::test]
async fn test_timeout_replaces_stalled_context() {
    let Fixture { handle, builds } = ready();
    let handle = handle
        .with_rpc_config(RpcConfig::default().with_default_timeout(Duration::from_millis(100)));
    handle.initialize().await.unwrap();

    let err = handle.send(slow_flip(), image()).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { timeout_ms: 100, .. }));
    assert_eq!(handle.state(), ContextState::Ready);
    assert_eq!(handle.pending_requests(), 0);
    assert_eq!(builds.load(Ordering::SeqCst), 2);

    // The fresh context answers at once instead of queueing behind the abandoned flip.
    let result = handle.send(crop(), image()).await.unwrap();
    assert_eq!(result.data.len(), 16);
}

#[tokio::test]
async fn test_submit_queues_concurrent_callers() {
    let Fixture { handle, builds } = ready();

    let (slow, fast) = tokio::join!(handle.submit(slow_flip(), image()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.submit(crop(), image()).await
    });

    assert!(slow.is_ok());
    assert_eq!(fast.unwrap().data.len(), 16);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), ContextState::Ready);
}

#[tokio::test]
async fn test_submit_restarts_after_transport_fault() {
    let Fixture { handle, builds } = ready();

    let err = handle.submit(crashing_flip(), image()).await.unwrap_err();
    assert!(matches!(err, RpcError::TransportError(_)));

    let result = handle.submit(crop(), image()).await.unwrap();
    assert_eq!(result.data.len(), 16);
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(handle.fault(), None);
}

#[tokio::test]
async fn test_remote_error_keeps_context_alive() {
    let Fixture { handle, .. } = ready();
    handle.initialize().await.unwrap();

    let jpeg = Operation::CompressJpeg(QualityParams { quality: 80 });
    let err = handle.send(jpeg, image()).await.unwrap_err();
    assert_eq!(err, RpcError::RemoteError("encoder out of memory".to_string()));

    assert!(handle.send(crop(), image()).await.is_ok());
}

#[tokio::test]
async fn test_collaborator_panic_is_transport_fault() {
    let Fixture { handle, builds } = ready();
    handle.initialize().await.unwrap();

    let err = handle.send(crashing_flip(), image()).await.unwrap_err();
    assert!(matches!(err, RpcError::TransportError(ref m) if m.contains("flip kernel crashed")));

    // The pump marks the handle once it sees the fault event.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), ContextState::Errored);
    assert!(matches!(handle.fault(), Some(ContextFault::Transport(_))));
    assert!(matches!(
        handle.send(crop(), image()).await,
        Err(RpcError::TransportError(_))
    ));

    handle.restart().await.unwrap();
    assert_eq!(handle.state(), ContextState::Ready);
    assert!(handle.send(crop(), image()).await.is_ok());
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restart_rejected_while_initializing() {
    let Fixture { handle, builds } = fixture(Duration::from_millis(200), false);

    let (first, restart) = tokio::join!(handle.initialize(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.restart().await
    });

    assert!(first.is_ok());
    assert!(matches!(
        restart,
        Err(RpcError::InitializationInProgress { .. })
    ));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_restart_rejects_in_flight_request() {
    let Fixture { handle, builds } = ready();
    handle.initialize().await.unwrap();

    let (slow, restarted) = tokio::join!(handle.send(slow_flip(), image()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.restart().await
    });

    assert!(matches!(slow, Err(RpcError::Terminated { .. })));
    assert!(restarted.is_ok());
    assert_eq!(handle.state(), ContextState::Ready);
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_terminate_rejects_pending_and_is_final() {
    let Fixture { handle, .. } = ready();
    handle.initialize().await.unwrap();

    let (slow, ()) = tokio::join!(handle.send(slow_flip(), image()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.terminate();
    });

    assert!(matches!(slow, Err(RpcError::Terminated { .. })));
    assert_eq!(handle.state(), ContextState::Terminated);
    assert!(matches!(
        handle.send(crop(), image()).await,
        Err(RpcError::Terminated { .. })
    ));
    assert!(matches!(
        handle.restart().await,
        Err(RpcError::Terminated { .. })
    ));
}
