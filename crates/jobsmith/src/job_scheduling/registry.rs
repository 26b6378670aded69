//! Run-function registry
//!
//! Jobs name their callable instead of holding it, so they stay serializable
//! and can cross into a child process. Workers resolve the name here.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use super::types::JobArgs;
use crate::errors::{JobError, JobOutcome};

pub type BlockingFn = Arc<dyn Fn(JobArgs) -> JobOutcome + Send + Sync>;
pub type AsyncFn = Arc<dyn Fn(JobArgs) -> BoxFuture<'static, JobOutcome> + Send + Sync>;

/// A callable registered under a name
#[derive(Clone)]
pub enum RunFunction {
    /// Runs to completion on the slot's thread
    Blocking(BlockingFn),
    /// Awaited on the slot's runtime
    Async(AsyncFn),
}

impl RunFunction {
    /// Invoke the function; a panic becomes a `Panic` job error
    pub async fn invoke(&self, args: JobArgs) -> JobOutcome {
        match self {
            RunFunction::Blocking(f) => catch_unwind(AssertUnwindSafe(|| f(args)))
                .unwrap_or_else(|payload| Err(JobError::panic(panic_message(payload.as_ref())))),
            RunFunction::Async(f) => {
                let f = f.clone();
                AssertUnwindSafe(async move { f(args).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(JobError::panic(panic_message(payload.as_ref())))
                    })
            }
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "run function panicked".to_string()
    }
}

/// Name-to-function table shared by every slot in a process
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<String, RunFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, function: RunFunction) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), function);
    }

    pub fn register_blocking<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(JobArgs) -> JobOutcome + Send + Sync + 'static,
    {
        self.register(name, RunFunction::Blocking(Arc::new(f)));
    }

    pub fn register_async<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        self.register(
            name,
            RunFunction::Async(Arc::new(move |args| f(args).boxed())),
        );
    }

    pub fn get(&self, name: &str) -> Option<RunFunction> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve and invoke `name`, reporting a missing function as a job error
    pub async fn call(&self, name: &str, args: JobArgs) -> JobOutcome {
        match self.get(name) {
            Some(function) => function.invoke(args).await,
            None => Err(JobError::unknown_function(name)),
        }
    }
}
