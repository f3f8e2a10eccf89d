use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqflow::{
    Client, Error, MockReply, MockTransport, Progress, Request, RequestFsm, RequestOptions,
    Response, StateError, Transaction, TransferListener, TransferState, WireRequest, WireResponse,
};
use tokio::time::Instant;

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl Recorder {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().expect("lock events").clone()
    }

    fn record(&self, event: &'static str) {
        self.events.lock().expect("lock events").push(event);
    }
}

impl TransferListener for Recorder {
    fn on_before(&self, _trans: &mut Transaction) -> Result<(), Error> {
        self.record("before");
        Ok(())
    }

    fn on_complete(&self, _trans: &mut Transaction) -> Result<(), Error> {
        self.record("complete");
        Ok(())
    }

    fn on_error(&self, _trans: &mut Transaction) -> Result<(), Error> {
        self.record("error");
        Ok(())
    }

    fn on_end(&self, _trans: &mut Transaction) -> Result<(), Error> {
        self.record("end");
        Ok(())
    }
}

struct FailOnComplete {
    once: bool,
    failed: AtomicBool,
}

impl TransferListener for FailOnComplete {
    fn on_complete(&self, _trans: &mut Transaction) -> Result<(), Error> {
        if self.once && self.failed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        Err(Error::other("rejected by listener"))
    }
}

struct RecoverOnError;

impl TransferListener for RecoverOnError {
    fn on_error(&self, trans: &mut Transaction) -> Result<(), Error> {
        trans.intercept(Response::with_status(200).with_body("recovered"));
        Ok(())
    }
}

fn request() -> Request {
    Request::get("http://foo.com/items").expect("request should build")
}

async fn run(machine: &RequestFsm) -> (Transaction, Result<Response, Error>) {
    let mut trans = Transaction::new(request());
    let outcome = machine.run(&mut trans, &RequestOptions::default()).await;
    (trans, outcome)
}

#[tokio::test]
async fn successful_transfer_passes_before_complete_end() {
    let recorder = Recorder::default();
    let mock = MockTransport::new([Response::with_status(200).with_body("ok")]);
    let machine = RequestFsm::new(mock.clone()).listener(recorder.clone());

    let (trans, outcome) = run(&machine).await;
    let response = outcome.expect("transfer should succeed");

    assert_eq!(recorder.events(), ["before", "complete", "end"]);
    assert_eq!(response.body().as_ref(), b"ok");
    assert_eq!(response.effective_url(), Some("http://foo.com/items"));
    assert_eq!(trans.state(), Some(&TransferState::End));
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn transport_failure_passes_before_error_end() {
    let recorder = Recorder::default();
    let mock = MockTransport::new([Error::other("connection refused")]);
    let machine = RequestFsm::new(mock).listener(recorder.clone());

    let (trans, outcome) = run(&machine).await;
    let error = outcome.expect_err("transfer should fail");

    assert_eq!(recorder.events(), ["before", "error", "end"]);
    match &error {
        Error::Request { message, uri, .. } => {
            assert_eq!(message, "connection refused");
            assert_eq!(uri, "http://foo.com/items");
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert!(trans.response.is_none());
    assert!(trans.exception.is_some());
}

#[tokio::test]
async fn complete_listener_failure_is_routed_to_error() {
    let recorder = Recorder::default();
    let mock = MockTransport::new([Response::with_status(200)]);
    let machine = RequestFsm::new(mock)
        .listener(recorder.clone())
        .listener(FailOnComplete {
            once: false,
            failed: AtomicBool::new(false),
        });

    let (_, outcome) = run(&machine).await;
    let error = outcome.expect_err("listener failure should surface");

    assert_eq!(recorder.events(), ["before", "complete", "error", "end"]);
    assert!(error.to_string().contains("rejected by listener"));
}

#[tokio::test]
async fn error_listener_can_intercept_and_complete() {
    let recorder = Recorder::default();
    let mock = MockTransport::new([Response::with_status(500)]);
    let machine = RequestFsm::new(mock)
        .listener(recorder.clone())
        .listener(FailOnComplete {
            once: true,
            failed: AtomicBool::new(false),
        })
        .listener(RecoverOnError);

    let (trans, outcome) = run(&machine).await;
    let response = outcome.expect("intercepted transfer should succeed");

    assert_eq!(
        recorder.events(),
        ["before", "complete", "error", "complete", "end"]
    );
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.body().as_ref(), b"recovered");
    assert!(trans.exception.is_none());
}

#[tokio::test]
async fn error_listener_failure_replaces_exception_and_ends() {
    struct FailingErrorListener;

    impl TransferListener for FailingErrorListener {
        fn on_error(&self, _trans: &mut Transaction) -> Result<(), Error> {
            Err(Error::other("error listener failed"))
        }
    }

    let recorder = Recorder::default();
    let mock = MockTransport::new([Error::other("connection refused")]);
    let machine = RequestFsm::new(mock)
        .listener(recorder.clone())
        .listener(FailingErrorListener);

    let (_, outcome) = run(&machine).await;
    let error = outcome.expect_err("replacement error should surface");

    assert_eq!(recorder.events(), ["before", "error", "end"]);
    assert!(error.to_string().contains("error listener failed"));
}

#[tokio::test]
async fn retry_clears_response_and_exception_before_next_attempt() {
    #[derive(Default)]
    struct RetryOnce {
        retried: AtomicBool,
        clean_on_retry: Mutex<Option<bool>>,
    }

    impl TransferListener for RetryOnce {
        fn on_before(&self, trans: &mut Transaction) -> Result<(), Error> {
            if self.retried.load(Ordering::SeqCst) {
                *self.clean_on_retry.lock().expect("lock") =
                    Some(trans.response.is_none() && trans.exception.is_none());
            }
            Ok(())
        }

        fn on_error(&self, trans: &mut Transaction) -> Result<(), Error> {
            if !self.retried.swap(true, Ordering::SeqCst) {
                trans.retry();
            }
            Ok(())
        }
    }

    let recorder = Recorder::default();
    let retry = Arc::new(RetryOnce::default());
    let mock = MockTransport::new(vec![
        MockReply::from(Error::other("connection reset")),
        MockReply::from(Response::with_status(200)),
    ]);
    let machine = RequestFsm::new(mock.clone())
        .listener(recorder.clone())
        .listener_arc(retry.clone());

    let (_, outcome) = run(&machine).await;
    let response = outcome.expect("second attempt should succeed");

    assert_eq!(response.status_code(), 200);
    assert_eq!(
        recorder.events(),
        ["before", "error", "before", "complete", "end"]
    );
    assert_eq!(*retry.clean_on_retry.lock().expect("lock"), Some(true));
    assert_eq!(mock.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn pending_delay_is_slept_once_per_run() {
    #[derive(Default)]
    struct RetryOnce(AtomicBool);

    impl TransferListener for RetryOnce {
        fn on_error(&self, trans: &mut Transaction) -> Result<(), Error> {
            if !self.0.swap(true, Ordering::SeqCst) {
                trans.retry();
            }
            Ok(())
        }
    }

    let mock = MockTransport::new(vec![
        MockReply::from(Error::other("connection reset")),
        MockReply::from(Response::with_status(200)),
    ]);
    let machine = RequestFsm::new(mock.clone()).listener(RetryOnce::default());
    let options = RequestOptions::new().delay(Duration::from_millis(100));

    let started = Instant::now();
    let mut trans = Transaction::new(request());
    machine
        .run(&mut trans, &options)
        .await
        .expect("second attempt should succeed");

    assert_eq!(mock.calls(), 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(200));
}

#[tokio::test]
async fn endless_retry_loop_hits_transition_ceiling() {
    struct AlwaysRetry;

    impl TransferListener for AlwaysRetry {
        fn on_complete(&self, trans: &mut Transaction) -> Result<(), Error> {
            trans.retry();
            Ok(())
        }
    }

    let transport = |_request: WireRequest| async { WireResponse::status(200) };
    let machine = RequestFsm::new(transport)
        .listener(AlwaysRetry)
        .max_transitions(10);

    let (trans, outcome) = run(&machine).await;
    let error = outcome.expect_err("loop should be broken");

    assert!(error.is_machine_fault());
    assert!(matches!(
        error,
        Error::State(StateError::TooManyTransitions { max: 10 })
    ));
    assert_eq!(trans.transition_count(), 11);
}

#[tokio::test]
async fn machine_faults_skip_listeners() {
    struct Faulty;

    impl TransferListener for Faulty {
        fn on_before(&self, _trans: &mut Transaction) -> Result<(), Error> {
            Err(StateError::MissingResponse.into())
        }
    }

    let recorder = Recorder::default();
    let mock = MockTransport::new([Response::with_status(200)]);
    let machine = RequestFsm::new(mock.clone())
        .listener(Faulty)
        .listener(recorder.clone());

    let (_, outcome) = run(&machine).await;
    let error = outcome.expect_err("fault should propagate");

    assert!(error.is_machine_fault());
    assert!(recorder.events().is_empty());
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn transport_without_status_or_error_breaks_contract() {
    let recorder = Recorder::default();
    let mock = MockTransport::new([WireResponse::default()]);
    let machine = RequestFsm::new(mock).listener(recorder.clone());

    let (_, outcome) = run(&machine).await;
    let error = outcome.expect_err("empty wire response is a contract violation");

    assert_eq!(recorder.events(), ["before", "error", "end"]);
    assert!(matches!(error, Error::TransportContract { .. }));
}

#[tokio::test]
async fn before_listener_can_short_circuit_the_transport() {
    struct Canned;

    impl TransferListener for Canned {
        fn on_before(&self, trans: &mut Transaction) -> Result<(), Error> {
            trans.intercept(Response::with_status(204));
            Ok(())
        }
    }

    let recorder = Recorder::default();
    let mock = MockTransport::default();
    let machine = RequestFsm::new(mock.clone())
        .listener(Canned)
        .listener(recorder.clone());

    let (_, outcome) = run(&machine).await;

    assert_eq!(outcome.expect("canned response").status_code(), 204);
    assert_eq!(recorder.events(), ["complete", "end"]);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn run_until_stops_before_the_requested_state() {
    let mock = MockTransport::new([Response::with_status(200)]);
    let machine = RequestFsm::new(mock.clone());
    let options = RequestOptions::default();
    let mut trans = Transaction::new(request());

    machine
        .run_until(&mut trans, &options, Some(&TransferState::Send))
        .await
        .expect("run should pause");
    assert_eq!(trans.state(), Some(&TransferState::Send));
    assert_eq!(mock.calls(), 0);

    let response = machine
        .run(&mut trans, &options)
        .await
        .expect("resumed run should finish");
    assert_eq!(response.status_code(), 200);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn progress_is_reported_only_to_interested_listeners() {
    #[derive(Default)]
    struct ProgressRecorder {
        seen: Mutex<Vec<Progress>>,
    }

    impl TransferListener for ProgressRecorder {
        fn wants_progress(&self) -> bool {
            true
        }

        fn on_progress(&self, _request: &Request, progress: Progress) {
            self.seen.lock().expect("lock").push(progress);
        }
    }

    let listener = Arc::new(ProgressRecorder::default());
    let mock = MockTransport::new([Response::with_status(200).with_body("12345")]);
    let machine = RequestFsm::new(mock.clone()).listener_arc(listener.clone());

    let mut trans = Transaction::new(request().with_body("abc"));
    machine
        .run(&mut trans, &RequestOptions::default())
        .await
        .expect("transfer should succeed");

    let seen = listener.seen.lock().expect("lock").clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].downloaded, 5);
    assert_eq!(seen[0].uploaded, 3);
    assert!(
        mock.last_request()
            .expect("wire request")
            .progress
            .is_some()
    );

    let quiet = MockTransport::new([Response::with_status(200)]);
    RequestFsm::new(quiet.clone())
        .run(&mut Transaction::new(request()), &RequestOptions::default())
        .await
        .expect("transfer should succeed");
    assert!(quiet.last_request().expect("wire request").progress.is_none());
}

#[tokio::test]
async fn client_listeners_observe_each_send_exactly_once() {
    let recorder = Recorder::default();
    let mock = MockTransport::new([Response::with_status(200), Response::with_status(201)]);
    let client = Client::builder()
        .transport(mock.clone())
        .listener(recorder.clone())
        .try_build()
        .expect("client should build");

    let first = client
        .get("http://foo.com/a")
        .send()
        .await
        .expect("first send");
    let second = client
        .get("http://foo.com/b")
        .send()
        .await
        .expect("second send");

    assert_eq!(first.status_code(), 200);
    assert_eq!(second.status_code(), 201);
    assert_eq!(
        recorder.events(),
        ["before", "complete", "end", "before", "complete", "end"]
    );
    let options = mock.last_options().expect("options reach the transport");
    assert!(options.client().is_some());
}
