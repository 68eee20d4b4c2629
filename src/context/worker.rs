//! The isolated side of an execution context: a dedicated thread owning one collaborator.
//!
//! Nothing is shared with the caller. Requests come in and responses go out as encoded
//! frames over channels; a panic inside the collaborator ends the thread and is reported as
//! a fault.

use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::collaborator::{Collaborator, CollaboratorError, CollaboratorFactory};
use crate::protocol::{
    decode_request, encode_response, ImagePayload, Operation, Response, ResponseData,
};

/// Messages from the caller into a context.
#[derive(Debug)]
pub enum ContextCommand {
    Request(Vec<u8>),
    Shutdown,
}

/// Messages from a context back to the caller.
#[derive(Debug)]
pub enum ContextEvent {
    /// First event of every context: the outcome of `Collaborator::initialize`
    Initialized(Result<(), String>),
    Response(Vec<u8>),
    /// The context hit an unrecoverable error and has stopped
    Fault(String),
}

pub(crate) struct SpawnedContext {
    pub commands: mpsc::UnboundedSender<ContextCommand>,
    pub events: mpsc::UnboundedReceiver<ContextEvent>,
}

pub(crate) fn spawn_context(
    thread_name: String,
    factory: CollaboratorFactory,
) -> io::Result<SpawnedContext> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_context(factory, command_rx, event_tx))?;

    Ok(SpawnedContext {
        commands: command_tx,
        events: event_rx,
    })
}

fn run_context(
    factory: CollaboratorFactory,
    mut commands: mpsc::UnboundedReceiver<ContextCommand>,
    events: mpsc::UnboundedSender<ContextEvent>,
) {
    let started = catch_unwind(AssertUnwindSafe(|| {
        let mut collaborator = factory();
        collaborator.initialize().map(|_| collaborator)
    }));

    let mut collaborator = match started {
        Ok(Ok(collaborator)) => {
            let _ = events.send(ContextEvent::Initialized(Ok(())));
            collaborator
        }
        Ok(Err(e)) => {
            let _ = events.send(ContextEvent::Initialized(Err(e.to_string())));
            return;
        }
        Err(panic) => {
            let _ = events.send(ContextEvent::Initialized(Err(format!(
                "collaborator panicked during initialization: {}",
                panic_message(panic.as_ref())
            ))));
            return;
        }
    };

    while let Some(command) = commands.blocking_recv() {
        let frame = match command {
            ContextCommand::Request(frame) => frame,
            ContextCommand::Shutdown => break,
        };

        let request = match decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                let _ = events.send(ContextEvent::Fault(e.to_string()));
                return;
            }
        };

        let started_at = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            execute(collaborator.as_mut(), &request.operation, &request.payload)
        }));
        let took_ms = started_at.elapsed().as_millis() as u64;

        let response = match outcome {
            Ok(Ok(data)) => Response::success(request.id, data, took_ms),
            Ok(Err(e)) => Response::failure(request.id, e.to_string(), took_ms),
            Err(panic) => {
                let message = format!(
                    "collaborator panicked while handling {}: {}",
                    request.operation.kind(),
                    panic_message(panic.as_ref())
                );
                error!(correlation_id = %request.id, "{}", message);
                let _ = events.send(ContextEvent::Fault(message));
                return;
            }
        };

        debug!(correlation_id = %response.id, took_ms = took_ms, success = response.is_success(), "Request handled");
        match encode_response(&response) {
            Ok(frame) => {
                if events.send(ContextEvent::Response(frame)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(ContextEvent::Fault(e.to_string()));
                return;
            }
        }
    }
}

/// Runs `operation` against the collaborator using a pre-sized output buffer.
pub(crate) fn execute(
    collaborator: &mut dyn Collaborator,
    operation: &Operation,
    payload: &ImagePayload,
) -> Result<ResponseData, CollaboratorError> {
    let capacity = operation
        .output_capacity(payload)
        .map_err(|e| CollaboratorError::failed(e.to_string()))?;
    let mut output = vec![0u8; capacity];
    let input = payload.data.as_ref();
    let (width, height) = (payload.width, payload.height);
    let mut quality = None;

    let written = match operation {
        Operation::Crop(p) => collaborator.crop(input, width, height, p, &mut output)?,
        Operation::Rotate(p) => collaborator.rotate(input, width, height, p, &mut output)?,
        Operation::Flip(p) => collaborator.flip(input, width, height, p, &mut output)?,
        Operation::Resize(p) => collaborator.resize(input, width, height, p, &mut output)?,
        Operation::CompressJpeg(p) => {
            collaborator.compress_jpeg(input, width, height, p, &mut output)?
        }
        Operation::CompressWebp(p) => {
            collaborator.compress_webp(input, width, height, p, &mut output)?
        }
        Operation::CompressToSize(p) => {
            let sized = collaborator.compress_to_size(input, width, height, p, &mut output)?;
            quality = Some(sized.quality);
            sized.size
        }
        Operation::RemoveSolidColor(p) => {
            collaborator.remove_solid_color(input, width, height, p, &mut output)?
        }
        Operation::MagicWand(p) => collaborator.magic_wand(input, width, height, p, &mut output)?,
        Operation::GrabCut(p) => collaborator.grabcut(input, width, height, p, &mut output)?,
    };

    if written > output.len() {
        return Err(CollaboratorError::failed(format!(
            "collaborator reported {} bytes written into a {}-byte buffer",
            written,
            output.len()
        )));
    }
    output.truncate(written);

    let (width, height) = operation.result_dimensions(payload);
    Ok(ResponseData {
        data: output.into(),
        width,
        height,
        quality,
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
