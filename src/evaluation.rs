//! Fitness evaluation of decision vectors.
//!
//! [`EvaluationClient`] fans a batch out to the worker pool of a job through
//! the broker and gathers the fitness vectors back, matching responses to
//! candidates by id. [`LocalEvaluator`] evaluates in-process with a closure.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use rayon::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
  broker::{Broker, Delivery},
  codec::Encoding,
  config::JobQueues,
  error::{BrokerError, EvalError, ReportError},
  protocol::{EvaluationRequest, EvaluationResponse, FailurePolicy, JobId},
  score::Scores,
};

/// Gets told whenever another candidate of a batch has been evaluated.
#[async_trait]
pub trait BatchObserver: Send {
  async fn on_evaluated(&mut self, done: usize, total: usize) -> Result<(), ReportError>;
}

/// A [`BatchObserver`] that ignores progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

#[async_trait]
impl BatchObserver for NoProgress {
  async fn on_evaluated(&mut self, _: usize, _: usize) -> Result<(), ReportError> {
    Ok(())
  }
}

/// Computes fitness vectors, one value per objective.
#[async_trait]
pub trait Evaluator: Send + Sync {
  /// Evaluates every vector of `batch`. Results are in batch order.
  async fn evaluate_batch(
    &self,
    batch: &[Vec<f64>],
    observer: &mut dyn BatchObserver,
  ) -> Result<Vec<Scores>, EvalError>;

  async fn evaluate(&self, genes: &[f64]) -> Result<Scores, EvalError> {
    let mut scores = self
      .evaluate_batch(&[genes.to_vec()], &mut NoProgress)
      .await?;
    scores.pop().ok_or(EvalError::Closed { outstanding: 1 })
  }
}

/// Evaluates in-process, in parallel, with a closure returning either the
/// fitness or an error message.
pub struct LocalEvaluator<F>(pub F);

#[async_trait]
impl<F> Evaluator for LocalEvaluator<F>
where
  F: Fn(&[f64]) -> Result<Scores, String> + Send + Sync,
{
  async fn evaluate_batch(
    &self,
    batch: &[Vec<f64>],
    observer: &mut dyn BatchObserver,
  ) -> Result<Vec<Scores>, EvalError> {
    let scores = batch
      .par_iter()
      .map(|genes| (self.0)(genes).map_err(|message| EvalError::Worker { message }))
      .collect::<Result<Vec<_>, _>>()?;
    for done in 1..=scores.len() {
      observer.on_evaluated(done, scores.len()).await?;
    }
    Ok(scores)
  }
}

/// Sends candidates to the evaluation workers of one job.
pub struct EvaluationClient {
  broker: Arc<dyn Broker>,
  job_id: JobId,
  queues: JobQueues,
  encoding: Encoding,
  objectives: usize,
  policy: FailurePolicy,
  penalty: Option<Scores>,
  timeout: Option<Duration>,
  responses: Mutex<BoxStream<'static, Result<Delivery, BrokerError>>>,
}

impl EvaluationClient {
  /// Declares the job's queues and subscribes to its responses. Failures
  /// abort the run unless [`EvaluationClient::with_failure_policy`] says
  /// otherwise.
  pub async fn connect(
    broker: Arc<dyn Broker>,
    job_id: JobId,
    queues: JobQueues,
    encoding: Encoding,
    objectives: usize,
  ) -> Result<Self, BrokerError> {
    broker.declare_queue(&queues.request).await?;
    broker.declare_queue(&queues.response).await?;
    let responses = broker.consume(&queues.response).await?;
    Ok(Self {
      broker,
      job_id,
      queues,
      encoding,
      objectives,
      policy: FailurePolicy::Abort,
      penalty: None,
      timeout: None,
      responses: Mutex::new(responses),
    })
  }

  /// `penalty` replaces the fitness of failed candidates under
  /// [`FailurePolicy::Penalize`].
  pub fn with_failure_policy(
    mut self,
    policy: FailurePolicy,
    penalty: Option<Scores>,
  ) -> Self {
    self.policy = policy;
    self.penalty = penalty;
    self
  }

  /// Upper bound on waiting for the responses of one batch.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn encoding(&self) -> &Encoding {
    &self.encoding
  }

  fn fitness_of(&self, response: EvaluationResponse) -> Result<Scores, EvalError> {
    let ind_id = response.ind_id.unwrap_or_default();
    if response.status_code.is_error() {
      return match (self.policy, &self.penalty) {
        (FailurePolicy::Penalize, Some(penalty)) => {
          warn!(ind_id, message = response.message, "evaluation failed, applying penalty");
          Ok(penalty.clone())
        }
        _ => Err(EvalError::Worker {
          message: response.message,
        }),
      };
    }
    let fitness = response
      .fitness
      .ok_or(EvalError::MissingFitness(ind_id))?;
    if fitness.len() != self.objectives {
      return Err(EvalError::FitnessLength {
        expected: self.objectives,
        found: fitness.len(),
      });
    }
    Ok(fitness)
  }
}

#[async_trait]
impl Evaluator for EvaluationClient {
  #[instrument(level = "debug", skip_all, fields(job = %self.job_id, batch = batch.len()))]
  async fn evaluate_batch(
    &self,
    batch: &[Vec<f64>],
    observer: &mut dyn BatchObserver,
  ) -> Result<Vec<Scores>, EvalError> {
    let total = batch.len();
    if total == 0 {
      return Ok(Vec::new());
    }
    // one batch in flight at a time
    let mut responses = self.responses.lock().await;

    let mut pending: HashMap<String, usize> = HashMap::with_capacity(total);
    for (idx, genes) in batch.iter().enumerate() {
      let ind_id = Uuid::new_v4().to_string();
      let request = EvaluationRequest {
        ind_id: ind_id.clone(),
        simulation_id: Uuid::new_v4().to_string(),
        objects_data: self.encoding.decode(genes)?,
        optimization_id: self.job_id.clone(),
      };
      self
        .broker
        .publish(&self.queues.request, serde_json::to_vec(&request)?)
        .await?;
      pending.insert(ind_id, idx);
    }
    debug!("published evaluation requests");

    let mut results: Vec<Option<Scores>> = vec![None; total];
    let mut done = 0;
    let gather = async {
      while done < total {
        let Some(delivery) = responses.next().await else {
          return Err(EvalError::Closed {
            outstanding: total - done,
          });
        };
        let mut delivery = delivery?;
        delivery.ack().await?;
        let response: EvaluationResponse =
          match serde_json::from_slice(&delivery.payload) {
            Ok(response) => response,
            Err(err) => {
              warn!(%err, "skipping malformed evaluation response");
              continue;
            }
          };
        let idx = response.ind_id.as_ref().and_then(|id| pending.remove(id));
        let Some(idx) = idx else {
          if response.ind_id.is_none() && response.status_code.is_error() {
            return Err(EvalError::Worker {
              message: response.message,
            });
          }
          debug!(ind_id = ?response.ind_id, "ignoring response of another batch");
          continue;
        };
        results[idx] = Some(self.fitness_of(response)?);
        done += 1;
        observer.on_evaluated(done, total).await?;
      }
      Ok::<(), EvalError>(())
    };

    let gathered = match self.timeout {
      Some(timeout) => tokio::time::timeout(timeout, gather).await.ok(),
      None => Some(gather.await),
    };
    match gathered {
      Some(gathered) => gathered?,
      None => {
        return Err(EvalError::Timeout {
          outstanding: total - done,
        })
      }
    }

    results
      .into_iter()
      .map(|fitness| fitness.ok_or(EvalError::Closed { outstanding: 1 }))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{
    broker::memory::InMemoryBroker,
    protocol::{StatusCode, WorkerMessage},
  };

  fn queues() -> JobQueues {
    JobQueues {
      request: "req".into(),
      response: "resp".into(),
    }
  }

  fn encoding() -> Encoding {
    Encoding::encode(&[json!({
      "id": 1,
      "x": {"min": 0.0, "max": 10.0},
    })])
    .unwrap()
  }

  /// Answers every request with `respond`, in reverse order of arrival.
  fn spawn_worker<F>(broker: InMemoryBroker, count: usize, respond: F)
  where
    F: Fn(&EvaluationRequest) -> EvaluationResponse + Send + 'static,
  {
    tokio::spawn(async move {
      let mut requests = broker.consume("req").await.unwrap();
      let mut received = Vec::new();
      while received.len() < count {
        let mut delivery = requests.next().await.unwrap().unwrap();
        delivery.ack().await.unwrap();
        if let WorkerMessage::Evaluate(request) =
          serde_json::from_slice(&delivery.payload).unwrap()
        {
          received.push(request);
        }
      }
      for request in received.iter().rev() {
        let response = serde_json::to_vec(&respond(request)).unwrap();
        broker.publish("resp", response).await.unwrap();
      }
    });
  }

  fn doubled(request: &EvaluationRequest) -> EvaluationResponse {
    let x = request.objects_data[0]["x"]["result"].as_f64().unwrap();
    EvaluationResponse {
      status_code: StatusCode::OK,
      ind_id: Some(request.ind_id.clone()),
      fitness: Some(vec![x * 2.0]),
      message: String::new(),
    }
  }

  struct Counter(Vec<(usize, usize)>);

  #[async_trait]
  impl BatchObserver for Counter {
    async fn on_evaluated(&mut self, done: usize, total: usize) -> Result<(), ReportError> {
      self.0.push((done, total));
      Ok(())
    }
  }

  async fn client(broker: &InMemoryBroker) -> EvaluationClient {
    EvaluationClient::connect(
      Arc::new(broker.clone()),
      "job".into(),
      queues(),
      encoding(),
      1,
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn test_results_follow_batch_order() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    spawn_worker(broker.clone(), 3, doubled);

    let mut counter = Counter(Vec::new());
    let scores = client
      .evaluate_batch(&[vec![1.0], vec![2.0], vec![3.0]], &mut counter)
      .await
      .unwrap();
    assert_eq!(scores, vec![vec![2.0], vec![4.0], vec![6.0]]);
    assert_eq!(counter.0, vec![(1, 3), (2, 3), (3, 3)]);
  }

  #[tokio::test]
  async fn test_worker_failure_aborts() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    spawn_worker(broker.clone(), 1, |request| EvaluationResponse {
      status_code: StatusCode::ERROR,
      ind_id: Some(request.ind_id.clone()),
      fitness: None,
      message: "sim crashed".into(),
    });

    let err = client.evaluate(&[1.0]).await.unwrap_err();
    assert!(matches!(err, EvalError::Worker { ref message } if message == "sim crashed"));
    assert!(err.to_string().contains("sim crashed"));
  }

  #[tokio::test]
  async fn test_worker_failure_penalized() {
    let broker = InMemoryBroker::new();
    let client = client(&broker)
      .await
      .with_failure_policy(FailurePolicy::Penalize, Some(vec![-1e9]));
    spawn_worker(broker.clone(), 2, |request| {
      let x = request.objects_data[0]["x"]["result"].as_f64().unwrap();
      if x > 5.0 {
        EvaluationResponse {
          status_code: StatusCode::ERROR,
          ind_id: Some(request.ind_id.clone()),
          fitness: None,
          message: "diverged".into(),
        }
      } else {
        doubled(request)
      }
    });

    let scores = client
      .evaluate_batch(&[vec![1.0], vec![9.0]], &mut NoProgress)
      .await
      .unwrap();
    assert_eq!(scores, vec![vec![2.0], vec![-1e9]]);
  }

  #[tokio::test]
  async fn test_fitness_length_is_checked() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    spawn_worker(broker.clone(), 1, |request| EvaluationResponse {
      fitness: Some(vec![1.0, 2.0]),
      ..doubled(request)
    });
    let err = client.evaluate(&[1.0]).await.unwrap_err();
    assert!(matches!(
      err,
      EvalError::FitnessLength {
        expected: 1,
        found: 2
      }
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_counts_outstanding() {
    let broker = InMemoryBroker::new();
    let client = client(&broker)
      .await
      .with_timeout(Some(Duration::from_secs(5)));
    let err = client
      .evaluate_batch(&[vec![1.0], vec![2.0]], &mut NoProgress)
      .await
      .unwrap_err();
    assert!(matches!(err, EvalError::Timeout { outstanding: 2 }));
  }

  #[tokio::test]
  async fn test_local_evaluator() {
    let evaluator = LocalEvaluator(|genes: &[f64]| -> Result<Vec<f64>, String> {
      Ok(vec![genes.iter().sum()])
    });
    let mut counter = Counter(Vec::new());
    let scores = evaluator
      .evaluate_batch(&[vec![1.0, 2.0], vec![3.0, 4.0]], &mut counter)
      .await
      .unwrap();
    assert_eq!(scores, vec![vec![3.0], vec![7.0]]);
    assert_eq!(counter.0.last(), Some(&(2, 2)));
  }
}
