//! Testing utilities for webhook endpoints
//!
//! Drives an axum [`Router`](axum::Router) in-process with
//! `tower::ServiceExt::oneshot`, so receivers can be exercised without
//! binding a socket.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidehook::testing;
//!
//! #[tokio::test]
//! async fn test_payment_webhook() {
//!     let verifier = SignatureVerifier::new("whsec_test");
//!     let app = WebhookRoutes::new(processor).router();
//!
//!     testing::post(app, "/webhooks")
//!         .signed_body(br#"{"id":"evt_1","type":"payment.succeeded"}"#, &verifier)
//!         .execute()
//!         .await
//!         .assert_ok()
//!         .assert_json_path("duplicate", serde_json::json!(false))
//!         .await;
//! }
//! ```

mod scenario;

pub use scenario::{Scenario, ScenarioAssert, get, post};
