//! **dmoga** is a distributed Multi-Objective Genetic Algorithm engine. It
//! searches the design parameters of an expensive simulation with NSGA-II or
//! a Nelder-Mead simplex, and farms every fitness evaluation out to a pool of
//! worker processes behind a message broker.
//!
//! Three kinds of processes cooperate, all of them built from this crate:
//! - the **orchestrator** ([`orchestrator::Orchestrator`]) accepts job
//!   requests, persists each job's configuration and starts one runner plus
//!   a pool of workers per job in containers ([`pool`])
//! - the **runner** ([`runner::run_job`]) drives the search engine of one job
//!   and publishes its progress
//! - **workers** ([`worker::run_worker`]) evaluate candidates with an
//!   external simulation
//!
//! Jobs never share a queue: the evaluation queues of a job are the base
//! names from [`config::Settings`] suffixed with the job id.
//!
//! # Engines
//!
//! Both engines implement [`Optimizer`] and talk to the outside world only
//! through an [`Evaluator`] and a [`Reporter`], so they run the same against
//! the broker-backed [`EvaluationClient`] and an in-process
//! [`LocalEvaluator`]:
//! ```
//! # use dmoga::{
//! #   codec::BoundSpec,
//! #   evaluation::LocalEvaluator,
//! #   optimizer::{nsga::Nsga2, Optimizer, Report},
//! #   termination::GenerationTerminator,
//! #   variation::Variation,
//! # };
//! # tokio_test_runtime(async {
//! // minimize `x^2` and `(x - 2)^2` on [-10, 10]
//! let evaluator = LocalEvaluator(|x: &[f64]| -> Result<Vec<f64>, String> {
//!   Ok(vec![x[0].powi(2), (x[0] - 2.0).powi(2)])
//! });
//! let nsga2 = Nsga2::builder()
//!   .bounds(vec![BoundSpec { index: 0, lower: -10.0, upper: 10.0, integer: false }])
//!   .weights(vec![-1.0, -1.0])
//!   .pop_size(20)
//!   .variation(Variation { cxpb: 0.6, mutpb: 0.3, eta: 20.0, indpb: 1.0 })
//!   .terminator(GenerationTerminator::total(10))
//!   .iteration_total(10)
//!   .build();
//! let mut reports: Vec<Report> = Vec::new();
//! let front = nsga2.optimize(&evaluator, &mut reports).await.unwrap();
//! assert!(!front.is_empty());
//! # });
//! # fn tokio_test_runtime(f: impl std::future::Future<Output = ()>) {
//! #   tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! [`Optimizer`]: crate::optimizer::Optimizer
//! [`Evaluator`]: crate::evaluation::Evaluator
//! [`Reporter`]: crate::optimizer::Reporter
//! [`EvaluationClient`]: crate::evaluation::EvaluationClient
//! [`LocalEvaluator`]: crate::evaluation::LocalEvaluator

pub mod archive;
pub mod broker;
pub mod codec;
pub mod config;
pub mod diversity;
pub mod error;
pub mod evaluation;
pub mod hypervolume;
pub mod individual;
pub mod job;
pub mod optimizer;
pub mod orchestrator;
pub mod pool;
pub mod protocol;
pub mod runner;
pub mod scalarization;
pub mod score;
pub mod selection;
pub mod template;
pub mod termination;
pub mod variation;
pub mod worker;
