use std::sync::Arc;

use log::{debug, error, info};

use crate::thread::{PoolConfig, PoolError, WorkerPool};

use super::{Client, Message, Program, unknown_program};

/// A message waiting for a worker.
pub struct Job<S> {
    client: Arc<dyn Client>,
    program: Option<Arc<Program<S>>>,
    message: Message,
}

/// Routes incoming messages to registered programs, either on a worker pool
/// or inline on the caller's thread.
pub struct RpcServer<S: Send + Sync + 'static> {
    state: Arc<S>,
    programs: Vec<Arc<Program<S>>>,
    pool: Option<WorkerPool<Job<S>>>,
}

impl<S: Send + Sync + 'static> RpcServer<S> {
    /// Creates a server dispatching on a worker pool sized by `config`.
    pub fn new(state: S, config: PoolConfig) -> Result<Self, PoolError> {
        let state = Arc::new(state);
        let handle = Arc::clone(&state);
        let pool = WorkerPool::new(config, move |job: Job<S>| handle_job(&*handle, job))?;

        Ok(Self {
            state,
            programs: Vec::new(),
            pool: Some(pool),
        })
    }

    /// Creates a server that dispatches every message on the calling thread.
    pub fn inline(state: S) -> Self {
        Self {
            state: Arc::new(state),
            programs: Vec::new(),
            pool: None,
        }
    }

    pub fn add_program(&mut self, program: Program<S>) -> Arc<Program<S>> {
        info!(
            "registered program {:x} version {}",
            program.id(),
            program.version()
        );
        let program = Arc::new(program);
        self.programs.push(Arc::clone(&program));
        program
    }

    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    pub fn pool(&self) -> Option<&WorkerPool<Job<S>>> {
        self.pool.as_ref()
    }

    /// Hands a decoded message from `client` to the matching program.
    ///
    /// Calls flagged as priority by their procedure go to the priority lane.
    /// An error means the message was not queued and the client should be
    /// dropped.
    pub fn dispatch(&self, client: Arc<dyn Client>, message: Message) -> Result<(), PoolError> {
        let program = self
            .programs
            .iter()
            .find(|program| program.matches(&message))
            .cloned();
        let job = Job {
            client,
            program,
            message,
        };

        match &self.pool {
            Some(pool) => {
                let priority = job
                    .program
                    .as_ref()
                    .is_some_and(|program| program.priority(job.message.header.procedure));
                debug!(
                    "queueing serial={} priority={priority}",
                    job.message.header.serial
                );
                pool.submit(priority, job)
            }
            None => {
                handle_job(&*self.state, job);
                Ok(())
            }
        }
    }

    /// Stops the worker pool; queued messages are dropped unanswered.
    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}

fn handle_job<S>(state: &S, job: Job<S>) {
    let Job {
        client,
        program,
        message,
    } = job;
    let header = message.header;

    let res = match program {
        Some(program) => program.dispatch(state, client.as_ref(), message),
        None => unknown_program(client.as_ref(), message, &header),
    };

    if let Err(e) = res {
        error!("closing client after failed reply to serial={}: {e}", header.serial);
        client.close();
    }
}
