mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use formflow_core::dead_letter::{DeadLetterStatus, DeadLetterStore};
use formflow_core::plugin::{plugin_breaker_key, ColumnType, PluginField, PluginTable};
use formflow_core::resilience::CircuitState;
use formflow_core::value::SqlValue;
use formflow_events::{verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use formflow_pipeline::{PopulationError, PopulationSettings, PopulationStatus};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn webhook_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/formflow"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

fn notes_table() -> PluginTable {
    PluginTable::new("notes", vec![PluginField::new("body", ColumnType::String)])
}

#[tokio::test]
async fn inserts_lead_and_sends_signed_success_webhook() {
    let harness = Harness::new();
    let db = crm_database();
    harness.builder.register(LEADS_CONFIG, db.clone());
    let server = webhook_server().await;
    let plugin = with_webhook(plugin(1, vec![leads_table()]), &server);

    let result = harness
        .population()
        .populate(
            &plugin,
            &fields(&[("leads.name", "Ann"), ("leads.email", "ann@x.com")]),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), PopulationStatus::Success);
    assert_eq!(result.inserted, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(result.tables.len(), 1);
    assert_eq!(result.tables[0].inserted, 1);

    let rows = db.rows("leads");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], SqlValue::Text("Ann".into()));
    assert_eq!(rows[0]["email"], SqlValue::Text("ann@x.com".into()));
    assert_eq!(db.commits(), 1);

    let requests = wait_for_requests(&server, 1).await;
    let request = &requests[0];
    let envelope = body(request);
    assert_eq!(envelope["event"], "population.success");
    assert_eq!(envelope["data"]["inserted"], 1);
    assert_eq!(envelope["data"]["failed"], 0);

    let payload = String::from_utf8(request.body.clone()).unwrap();
    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    let timestamp = request.headers.get(TIMESTAMP_HEADER).unwrap().to_str().unwrap();
    assert!(verify_signature(&payload, WEBHOOK_SECRET, timestamp, signature));
}

#[tokio::test]
async fn inactive_plugin_is_refused_before_connecting() {
    let harness = Harness::new();
    harness.builder.register(LEADS_CONFIG, crm_database());
    let mut plugin = plugin(1, vec![leads_table()]);
    plugin.is_active = false;

    let result = harness
        .population()
        .populate(&plugin, &fields(&[("name", "Ann")]))
        .await;

    assert_matches!(result, Err(PopulationError::PluginInactive(1)));
    assert!(harness.builder.builds().is_empty());
}

#[tokio::test]
async fn plugin_without_tables_is_refused() {
    let harness = Harness::new();
    let plugin = plugin(4, Vec::new());

    let result = harness
        .population()
        .populate(&plugin, &fields(&[("name", "Ann")]))
        .await;

    assert_matches!(result, Err(PopulationError::NoTables(4)));
}

#[tokio::test]
async fn failing_table_rolls_back_alone_and_dead_letters_its_rows() {
    let harness = Harness::new();
    let db = crm_database();
    db.fail_table("notes", "permission denied for table notes");
    harness.builder.register(LEADS_CONFIG, db.clone());
    let server = webhook_server().await;
    let plugin = with_webhook(plugin(2, vec![leads_table(), notes_table()]), &server);

    let result = harness
        .population()
        .populate(
            &plugin,
            &fields(&[("leads.name", "Ann"), ("notes.body", "Call back Friday")]),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), PopulationStatus::Partial);
    assert_eq!(result.inserted, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.dead_lettered, 1);
    assert_eq!(result.tables[1].table, "notes");
    assert!(result.tables[1]
        .error
        .as_deref()
        .unwrap()
        .contains("permission denied"));

    assert_eq!(db.rows("leads").len(), 1);
    assert!(db.rows("notes").is_empty());
    assert_eq!(db.rollbacks(), 1);

    let entries = harness.store.all().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].plugin_id, 2);
    assert_eq!(entries[0].table_name, "notes");
    assert_eq!(entries[0].status, DeadLetterStatus::Pending);
    assert_eq!(entries[0].attempt_count, 0);
    assert_eq!(
        entries[0].payload["body"],
        SqlValue::Text("Call back Friday".into())
    );

    let requests = wait_for_requests(&server, 1).await;
    assert_eq!(body(&requests[0])["event"], "population.partial");
}

#[tokio::test]
async fn unreachable_database_dead_letters_every_row() {
    let harness = Harness::new();
    let server = webhook_server().await;
    // No database registered for the config: every call is refused.
    let plugin = with_webhook(plugin(3, vec![leads_table(), notes_table()]), &server);

    let result = harness
        .population()
        .populate(
            &plugin,
            &fields(&[("leads.name", "Ann"), ("notes.body", "hello")]),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), PopulationStatus::Failed);
    assert_eq!(result.inserted, 0);
    assert_eq!(result.failed, 2);
    assert_eq!(result.dead_lettered, 2);
    assert!(result
        .tables
        .iter()
        .all(|t| t.error.as_deref().unwrap().contains("connection refused")));

    let counts = harness.store.count_by_status().await.unwrap();
    assert_eq!(counts.pending, 2);

    let requests = wait_for_requests(&server, 1).await;
    let envelope = body(&requests[0]);
    assert_eq!(envelope["event"], "population.failed");
    assert_eq!(envelope["data"]["failed"], 2);
}

#[tokio::test]
async fn undecryptable_credentials_exhaust_rows_without_tripping_breaker() {
    let harness = Harness::new();
    let db = crm_database();
    db.set_undecryptable(true);
    harness.builder.register(LEADS_CONFIG, db.clone());
    let plugin = plugin(7, vec![leads_table()]);

    for name in ["Ann", "Bob"] {
        let result = harness
            .population()
            .populate(&plugin, &fields(&[("name", name)]))
            .await
            .unwrap();
        assert_eq!(result.status(), PopulationStatus::Failed);
        assert_eq!(result.dead_lettered, 1);
        assert!(result.tables[0]
            .error
            .as_deref()
            .unwrap()
            .contains("could not be decrypted"));
    }

    let counts = harness.store.count_by_status().await.unwrap();
    assert_eq!((counts.pending, counts.exhausted), (0, 2));
    assert!(harness
        .store
        .all()
        .await
        .iter()
        .all(|e| e.status == DeadLetterStatus::Exhausted && e.next_retry_at.is_none()));

    let breaker = harness.factory.breakers().get(&plugin_breaker_key(7)).await;
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(db.rows("leads").is_empty());
}

#[tokio::test]
async fn uncoercible_field_is_reported_and_row_still_inserted() {
    let harness = Harness::new();
    let db = crm_database();
    harness.builder.register(LEADS_CONFIG, db.clone());
    let mut table = leads_table();
    table.fields.push(PluginField::new("age", ColumnType::Integer));
    let plugin = plugin(5, vec![table]);

    let result = harness
        .population()
        .populate(&plugin, &fields(&[("name", "Ann"), ("age", "about thirty")]))
        .await
        .unwrap();

    assert_eq!(result.inserted, 1);
    assert_eq!(result.field_errors.len(), 1);
    assert_eq!(result.field_errors[0].column, "age");

    let rows = db.rows("leads");
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].contains_key("age"));
}

#[tokio::test]
async fn nothing_routable_skips_connector_and_webhook() {
    let harness = Harness::new();
    harness.builder.register(LEADS_CONFIG, crm_database());
    let server = webhook_server().await;
    let plugin = with_webhook(plugin(6, vec![leads_table()]), &server);

    let result = harness
        .population()
        .populate(&plugin, &fields(&[("orders.total", "12"), ("phone", "555")]))
        .await
        .unwrap();

    assert_eq!(result.status(), PopulationStatus::Success);
    assert_eq!(result.inserted, 0);
    assert!(result.tables.is_empty());
    assert!(harness.builder.builds().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_shares_one_transaction_per_table() {
    let harness = Harness::new();
    let db = crm_database();
    harness.builder.register(LEADS_CONFIG, db.clone());
    let plugin = plugin(7, vec![leads_table()]);
    let submissions = vec![
        fields(&[("name", "Ann"), ("email", "ann@x.com")]),
        fields(&[("name", "Bob")]),
        fields(&[("name", "Cy"), ("email", "cy@x.com")]),
    ];

    let result = harness
        .population()
        .populate_batch(&plugin, &submissions)
        .await
        .unwrap();

    assert_eq!(result.inserted, 3);
    assert_eq!(result.tables.len(), 1);
    assert_eq!(db.rows("leads").len(), 3);
    assert_eq!(db.commits(), 1);
}

#[tokio::test]
async fn one_bad_row_rolls_back_the_whole_table_batch() {
    let harness = Harness::new();
    let db = crm_database();
    db.reject_value("leads", "email", SqlValue::Text("dup@x.com".into()));
    harness.builder.register(LEADS_CONFIG, db.clone());
    let plugin = plugin(8, vec![leads_table()]);
    let submissions = vec![
        fields(&[("name", "Ann"), ("email", "ann@x.com")]),
        fields(&[("name", "Dup"), ("email", "dup@x.com")]),
    ];

    let result = harness
        .population()
        .populate_batch(&plugin, &submissions)
        .await
        .unwrap();

    assert_eq!(result.status(), PopulationStatus::Failed);
    assert_eq!(result.failed, 2);
    assert_eq!(result.dead_lettered, 2);
    assert!(db.rows("leads").is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_table_times_out_and_is_dead_lettered() {
    let harness = Harness::new();
    let db = crm_database();
    db.set_insert_delay(Duration::from_secs(60));
    harness.builder.register(LEADS_CONFIG, db.clone());
    let plugin = plugin(9, vec![leads_table()]);
    let population = harness.population_with(PopulationSettings {
        transaction_timeout: Some(Duration::from_secs(5)),
    });

    let result = population
        .populate(&plugin, &fields(&[("name", "Ann")]))
        .await
        .unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.dead_lettered, 1);
    assert!(result.tables[0].error.as_deref().unwrap().contains("timed out"));
    assert!(db.rows("leads").is_empty());
    assert_eq!(db.commits(), 0);
}
