use std::time::Duration;

use test_timeout::tokio_timeout_test;

#[tokio_timeout_test(secs = 5)]
async fn passing_body_reports_success() -> Result<(), String> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    Ok(())
}

#[tokio_timeout_test(secs = 1)]
#[should_panic(expected = "test timed out")]
async fn blocking_body_still_hits_deadline() {
    std::thread::sleep(Duration::from_secs(4));
}

#[tokio_timeout_test(secs = 1)]
#[should_panic(expected = "test timed out")]
async fn pending_body_hits_deadline() {
    std::future::pending::<()>().await;
}

#[tokio_timeout_test(secs = 5)]
#[should_panic(expected = "sensor offline")]
async fn error_output_fails_the_test() -> Result<(), String> {
    Err("sensor offline".to_string())
}
