use anyhow::Result;
use assert_matches::assert_matches;
use async_trait::async_trait;
use geo::{point, polygon, MultiPolygon};
use geocollect::apis::{FeatureService, FeatureSet, QueryRequest};
use geocollect::artifact::{self, Feature, FeatureTable};
use geocollect::catalog::SourceDefinition;
use geocollect::error::CollectError;
use geocollect::geometry::{Boundary, Crs};
use geocollect::pipeline::executor::ReconnectPolicy;
use geocollect::pipeline::{QueryExecutor, QueryOutcome};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Fails the first `failures` calls, then answers with `points` features.
struct FlakyService {
    calls: AtomicU32,
    failures: u32,
    points: usize,
    delay: Option<Duration>,
}

impl FlakyService {
    fn new(failures: u32, points: usize) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            points,
            delay: None,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureService for FlakyService {
    async fn select_by_location(&self, _request: &QueryRequest) -> geocollect::Result<FeatureSet> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call <= self.failures {
            return Err(CollectError::Service {
                message: format!("connection reset on call {call}"),
            });
        }
        let mut table = FeatureTable::new(Crs::Wgs84);
        for i in 0..self.points {
            table.push(Feature::new(point!(x: -106.6 + i as f64 * 0.01, y: 35.1)).with_property("NAME", format!("site {i}")));
        }
        Ok(FeatureSet { table })
    }

    async fn check_connection(&self, _url: &str) -> geocollect::Result<()> {
        Ok(())
    }
}

fn request() -> QueryRequest {
    let square = polygon![
        (x: -107.0, y: 35.0),
        (x: -106.0, y: 35.0),
        (x: -106.0, y: 36.0),
        (x: -107.0, y: 36.0),
    ];
    let boundary = Boundary {
        geometry: MultiPolygon(vec![square]),
        crs: Crs::Wgs84,
    };
    let source = SourceDefinition::new("HIFLD_Hospitals", "https://example.org/rest/services", "Hospitals", 0, Crs::Wgs84);
    QueryRequest::new(source, Arc::new(boundary))
}

fn executor(service: Arc<FlakyService>, attempts: u32) -> QueryExecutor {
    QueryExecutor::new(service).with_policy(Arc::new(ReconnectPolicy { attempt_limit: attempts }))
}

#[tokio::test]
async fn persistent_failure_stops_after_attempt_limit() -> Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("hospitals.geojson");
    let service = Arc::new(FlakyService::new(u32::MAX, 1));

    let outcome = executor(service.clone(), 3).execute(&request(), &target).await?;

    assert_matches!(outcome, QueryOutcome::Unavailable { attempts: 3, ref last_error } if last_error.contains("call 3"));
    assert_eq!(service.calls(), 3);
    assert!(!target.exists());
    Ok(())
}

#[tokio::test]
async fn transient_failure_is_retried_until_success() -> Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("hospitals.geojson");
    let service = Arc::new(FlakyService::new(2, 4));

    let outcome = executor(service.clone(), 5).execute(&request(), &target).await?;

    assert_matches!(outcome, QueryOutcome::Collected { count: 4, .. });
    assert_eq!(service.calls(), 3);
    let written = artifact::read_table(&target)?;
    assert_eq!(written.len(), 4);
    assert_eq!(written.features[0].text("NAME").as_deref(), Some("site 0"));
    Ok(())
}

#[tokio::test]
async fn empty_answer_is_not_retried() -> Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("hospitals.geojson");
    let service = Arc::new(FlakyService::new(0, 0));

    let outcome = executor(service.clone(), 5).execute(&request(), &target).await?;

    assert_eq!(outcome, QueryOutcome::Empty);
    assert_eq!(outcome.count(), 0);
    assert_eq!(service.calls(), 1);
    assert!(!target.exists());
    Ok(())
}

#[tokio::test]
async fn slow_attempts_count_as_failures() -> Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("hospitals.geojson");
    let service = Arc::new(FlakyService {
        delay: Some(Duration::from_millis(200)),
        ..FlakyService::new(0, 1)
    });

    let outcome = executor(service.clone(), 2)
        .with_attempt_timeout(Some(Duration::from_millis(20)))
        .execute(&request(), &target)
        .await?;

    assert_matches!(outcome, QueryOutcome::Unavailable { attempts: 2, ref last_error } if last_error.contains("timed out"));
    assert_eq!(service.calls(), 2);
    Ok(())
}
