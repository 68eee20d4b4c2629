use offload::batch::{BatchScheduler, Task, TaskStatus};
use offload::config::{ContextConfig, OffloadConfig, RpcConfig};
use offload::context::{
    collaborator_factory, Collaborator, CollaboratorError, CollaboratorResult, ContextRegistry,
    ContextState, ExecutionContextHandle,
};
use offload::protocol::{
    CompressToSizeParams, CompressionFormat, CropParams, FlipDirection, FlipParams, ImagePayload,
    MagicWandParams, Operation, OperationFamily, QualityParams, ResizeParams, ResizeQuality,
    RotateAngle, RotateParams,
};
use offload::rpc::FailureKind;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// Transform collaborator backed by plain pixel copies.
/// Rotation crashes the context and resizing stalls for 300ms.
struct Mirror;

impl Collaborator for Mirror {
    fn initialize(&mut self) -> CollaboratorResult<()> {
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
        width: u32,
        height: u32,
        params: &FlipParams,
        output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        std::thread::sleep(Duration::from_millis(10));
        let (w, h) = (width as usize, height as usize);
        for y in 0..h {
            for x in 0..w {
                let (sx, sy) = match params.direction {
                    FlipDirection::Horizontal => (w - 1 - x, y),
                    FlipDirection::Vertical => (x, h - 1 - y),
                };
                let dst = (y * w + x) * 4;
                let src = (sy * w + sx) * 4;
                output[dst..dst + 4].copy_from_slice(&input[src..src + 4]);
            }
        }
        Ok(w * h * 4)
    }

    fn rotate(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &RotateParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        panic!("bad input")
    }

    fn resize(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &ResizeParams,
        output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        std::thread::sleep(Duration::from_millis(300));
        output.fill(0);
        Ok(output.len())
    }
}

/// Compression collaborator whose codec never loads.
struct MissingCodec;

impl Collaborator for MissingCodec {
    fn initialize(&mut self) -> CollaboratorResult<()> {
        Err(CollaboratorError::failed("codec module failed to load"))
    }
}

fn image(width: u32, height: u32) -> ImagePayload {
    let data: Vec<u8> = (0..width * height * 4).map(|b| b as u8).collect();
    ImagePayload::new(data, width, height)
}

fn flip() -> Operation {
    Operation::Flip(FlipParams {
        direction: FlipDirection::Vertical,
    })
}

fn single_transform_context(timeout: Duration) -> ContextRegistry {
    ContextRegistry::builder()
        .with_context_config(ContextConfig::default().with_contexts_per_family(1))
        .with_rpc_config(RpcConfig::default().with_default_timeout(timeout))
        .family(OperationFamily::Transform, collaborator_factory(|| Mirror))
        .build()
        .unwrap()
}

fn registry() -> ContextRegistry {
    ContextRegistry::builder()
        .with_context_config(ContextConfig::default().with_contexts_per_family(2))
        .with_rpc_config(RpcConfig::default().with_default_timeout(Duration::from_secs(5)))
        .family(OperationFamily::Transform, collaborator_factory(|| Mirror))
        .family(OperationFamily::Compression, collaborator_factory(|| MissingCodec))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_batch_over_context_registry() {
    let registry = Arc::new(registry());
    let scheduler = BatchScheduler::new(registry.clone());

    let mut tasks: Vec<Task> = (0..6)
        .map(|i| {
            let direction = if i % 2 == 0 {
                FlipDirection::Horizontal
            } else {
                FlipDirection::Vertical
            };
            Task::new(
                format!("flip-{}", i),
                Operation::Flip(FlipParams { direction }),
                image(3, 2),
            )
        })
        .collect();
    tasks.push(Task::new(
        "crop",
        Operation::Crop(CropParams {
            x: 1,
            y: 0,
            width: 2,
            height: 2,
        }),
        image(3, 2),
    ));
    tasks.push(Task::new(
        "jpeg",
        Operation::CompressJpeg(QualityParams { quality: 85 }),
        image(3, 2),
    ));
    tasks.push(Task::new(
        "wand",
        Operation::MagicWand(MagicWandParams {
            seed_x: 0,
            seed_y: 0,
            tolerance: 10,
            connected: true,
        }),
        image(3, 2),
    ));

    let outcomes = scheduler.run(tasks, 3).await.unwrap();

    assert_eq!(outcomes.len(), 9);
    let ids: Vec<_> = outcomes.iter().map(|o| o.task_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["flip-0", "flip-1", "flip-2", "flip-3", "flip-4", "flip-5", "crop", "jpeg", "wand"]
    );
    assert!(outcomes[..7].iter().all(|o| o.status == TaskStatus::Completed));

    // Horizontal flip of a 3x2 image swaps the first and last pixel of each row.
    let flipped = outcomes[0].result.as_ref().unwrap();
    assert_eq!(&flipped.data[..4], &[8, 9, 10, 11]);
    assert_eq!((flipped.width, flipped.height), (3, 2));

    let cropped = outcomes[6].result.as_ref().unwrap();
    assert_eq!((cropped.width, cropped.height), (2, 2));
    assert_eq!(cropped.data.len(), 16);

    assert_eq!(outcomes[7].failure_kind, Some(FailureKind::Initialization));
    assert!(outcomes[7]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("codec module failed to load"));
    assert_eq!(outcomes[8].failure_kind, Some(FailureKind::NotReady));

    let status = scheduler.status();
    assert_eq!((status.completed, status.failed), (7, 2));
    assert_eq!(status.progress_percent, 100);

    let counts = registry.state_counts();
    assert_eq!(counts.get(&ContextState::Errored), Some(&1));
    registry.terminate_all();
    assert_eq!(registry.state_counts().get(&ContextState::Terminated), Some(&4));
}

#[tokio::test]
async fn test_initialize_all_reports_failed_family() {
    let registry = registry();
    let err = registry.initialize_all().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Initialization);

    let ready = registry
        .handles(OperationFamily::Transform)
        .iter()
        .all(|h| h.state() == ContextState::Ready);
    assert!(ready);
}

#[tokio::test]
async fn test_single_handle_serves_a_batch() {
    let handle = Arc::new(ExecutionContextHandle::new(
        "transform-solo",
        collaborator_factory(|| Mirror),
    ));
    let scheduler = BatchScheduler::new(handle.clone());

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            Task::generated(
                Operation::Flip(FlipParams {
                    direction: FlipDirection::Vertical,
                }),
                image(2, 2),
            )
        })
        .collect();

    let outcomes = scheduler.run(tasks, 1).await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_completed()));
    assert_eq!(handle.state(), ContextState::Ready);
}

#[tokio::test]
async fn test_single_handle_with_wider_window() {
    let handle = Arc::new(ExecutionContextHandle::new(
        "transform-solo",
        collaborator_factory(|| Mirror),
    ));
    let scheduler = BatchScheduler::new(handle.clone());
    let tasks: Vec<_> = (0..6).map(|_| Task::generated(flip(), image(2, 2))).collect();

    let outcomes = scheduler.run(tasks, 3).await.unwrap();

    assert!(outcomes.iter().all(|o| o.is_completed()), "{:?}", outcomes);
    let status = scheduler.status();
    assert_eq!((status.completed, status.failed), (6, 0));
    assert_eq!(handle.state(), ContextState::Ready);
}

#[tokio::test]
async fn test_crashed_context_spares_later_tasks() {
    let registry = Arc::new(single_transform_context(Duration::from_secs(5)));
    let scheduler = BatchScheduler::new(registry.clone());

    let mut tasks = vec![Task::new(
        "rotate",
        Operation::Rotate(RotateParams {
            angle: RotateAngle::Degree90,
        }),
        image(2, 2),
    )];
    tasks.extend((0..3).map(|i| Task::new(format!("flip-{}", i), flip(), image(2, 2))));

    let outcomes = scheduler.run(tasks, 1).await.unwrap();

    assert_eq!(outcomes[0].failure_kind, Some(FailureKind::Transport));
    assert!(outcomes[0].error.as_deref().unwrap_or_default().contains("bad input"));
    assert!(outcomes[1..].iter().all(|o| o.is_completed()), "{:?}", outcomes);
    let handle = &registry.handles(OperationFamily::Transform)[0];
    assert_eq!(handle.state(), ContextState::Ready);
}

#[tokio::test]
async fn test_slow_task_does_not_time_out_its_successors() {
    let registry = Arc::new(single_transform_context(Duration::from_millis(100)));
    let scheduler = BatchScheduler::new(registry);

    let mut tasks = vec![Task::new(
        "resize",
        Operation::Resize(ResizeParams {
            width: 2,
            height: 2,
            quality: ResizeQuality::High,
        }),
        image(2, 2),
    )];
    tasks.extend((0..3).map(|i| Task::new(format!("flip-{}", i), flip(), image(2, 2))));

    let outcomes = scheduler.run(tasks, 1).await.unwrap();

    assert_eq!(outcomes[0].failure_kind, Some(FailureKind::Timeout));
    assert!(outcomes[1..].iter().all(|o| o.is_completed()), "{:?}", outcomes);
}

#[tokio::test]
async fn test_unsupported_compression_reaches_caller_as_remote_error() {
    let registry = ContextRegistry::builder()
        .with_context_config(ContextConfig::default().with_contexts_per_family(1))
        .family(OperationFamily::Compression, collaborator_factory(|| Mirror))
        .build()
        .unwrap();
    let scheduler = BatchScheduler::new(Arc::new(registry));

    let task = Task::new(
        "to-size",
        Operation::CompressToSize(CompressToSizeParams {
            target_size: 1024,
            format: CompressionFormat::WebP,
        }),
        image(2, 2),
    );
    let outcomes = scheduler.run(vec![task], 1).await.unwrap();
    assert_eq!(outcomes[0].failure_kind, Some(FailureKind::Remote));
}

#[test]
fn test_registry_from_json_config() {
    let config = OffloadConfig::from_json(
        r#"{"context": {"contexts_per_family": 3, "init_timeout_ms": 2000}}"#,
    )
    .unwrap();
    let registry = ContextRegistry::builder()
        .with_context_config(config.context)
        .with_rpc_config(config.rpc)
        .family(OperationFamily::Segmentation, collaborator_factory(|| MissingCodec))
        .build()
        .unwrap();
    assert_eq!(registry.handles(OperationFamily::Segmentation).len(), 3);
}
