mod common;

use anyhow::Result;
use illbroker_core::database::ports::{LocatedSupplierRepository, TransactionRepository};
use illbroker_core::workflow::keys;
use illbroker_model::{
    BrokerMode, EventName, EventStatus, ProblemKind, ReasonForMessage, RequesterAction,
    SupplierSelection, SupplierStatus,
};
use tokio_util::sync::CancellationToken;

use common::{
    BROKER, Harness, RecordingSender, count, history, request, requester_says, supplier_says,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loan_is_relayed_until_completed() -> Result<()> {
    let harness = Harness::start(BrokerMode::Opaque, &[("ISIL:SUP", 0, 1)]).await;
    let intake = harness.broker.intake();

    let transaction = intake
        .request_received(request("loan-1", "return-ISIL:SUP"))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 1
        })
        .await?;

    for (status, relayed) in [(SupplierStatus::Loaned, 1), (SupplierStatus::LoanCompleted, 2)] {
        intake
            .supplying_agency_message_received(supplier_says(
                "loan-1",
                "ISIL:SUP",
                status,
                ReasonForMessage::StatusChange,
            ))
            .await?;
        harness
            .wait_until(transaction.id, |events| {
                count(events, "message-requester", "SUCCESS") == relayed
            })
            .await?;
    }

    let events = harness.events(transaction.id).await;
    assert_eq!(
        history(&events),
        [
            "request-received SUCCESS",
            "locate-suppliers SUCCESS",
            "select-supplier SUCCESS",
            "message-supplier SUCCESS",
            "supplier-msg-received SUCCESS",
            "message-requester SUCCESS",
            "supplier-msg-received SUCCESS",
            "message-requester SUCCESS",
        ]
    );

    let stored = harness
        .db
        .get(transaction.id)
        .await?
        .expect("transaction stored");
    assert_eq!(stored.last_supplier_status, Some(SupplierStatus::LoanCompleted));
    assert_eq!(stored.prev_supplier_status, Some(SupplierStatus::Loaned));
    assert_eq!(stored.supplier_symbol.as_deref(), Some("ISIL:SUP"));

    let sent = harness.sender.sent().await;
    assert_eq!(sent.len(), 3);
    let (to, first) = &sent[0];
    assert_eq!(to, "ISIL:SUP");
    assert_eq!(first.header().requesting_agency_id, BROKER);
    let (to, last) = &sent[2];
    assert_eq!(to, common::REQUESTER);
    assert_eq!(last.supplier_status(), Some(SupplierStatus::LoanCompleted));
    assert_eq!(last.header().supplying_agency_id, BROKER);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sole_supplier_unfilled_reaches_requester() -> Result<()> {
    let harness = Harness::start(BrokerMode::Opaque, &[("ISIL:SUP", 0, 1)]).await;
    let intake = harness.broker.intake();
    let mut notifications = harness.broker.subscribe_notifications();

    let transaction = intake
        .request_received(request("unfilled-1", "return-ISIL:SUP"))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 1
        })
        .await?;

    intake
        .supplying_agency_message_received(supplier_says(
            "unfilled-1",
            "ISIL:SUP",
            SupplierStatus::Unfilled,
            ReasonForMessage::RequestResponse,
        ))
        .await?;
    let events = harness
        .wait_until(transaction.id, |events| {
            count(events, "message-requester", "SUCCESS") == 1
        })
        .await?;

    let selects: Vec<_> = events
        .iter()
        .filter(|event| event.event_name == EventName::SelectSupplier)
        .collect();
    assert_eq!(selects.len(), 2);
    assert_eq!(selects[1].event_status, EventStatus::Problem);
    let problem = selects[1]
        .result_data
        .as_ref()
        .and_then(|data| data.problem_record())
        .expect("problem recorded");
    assert_eq!(problem.kind, ProblemKind::NoNewSuppliers);
    assert_eq!(problem.message, "no suppliers with new status");

    let last = events.last().expect("history not empty");
    assert_eq!(last.event_name, EventName::MessageRequester);
    assert_eq!(last.event_status, EventStatus::Success);
    assert_eq!(last.event_data.custom_str(keys::STATUS), Some("Unfilled"));

    let notified = notifications.recv().await?;
    assert_eq!(notified.transaction_id, transaction.id);
    assert_eq!(notified.status, Some(SupplierStatus::Unfilled));

    // The exhausted rota must not start another selection round.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let events = harness.events(transaction.id).await;
    assert_eq!(count(&events, "select-supplier", "PROBLEM"), 1);
    assert_eq!(count(&events, "select-supplier", "SUCCESS"), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_record_is_unfilled_without_selection() -> Result<()> {
    let harness = Harness::start(BrokerMode::Opaque, &[("ISIL:SUP", 0, 1)]).await;

    let transaction = harness
        .broker
        .intake()
        .request_received(request("nohold-1", "rec-without-holdings"))
        .await?;
    let events = harness
        .wait_until(transaction.id, |events| {
            count(events, "message-requester", "SUCCESS") == 1
        })
        .await?;

    assert_eq!(
        history(&events),
        [
            "request-received SUCCESS",
            "locate-suppliers PROBLEM",
            "message-requester SUCCESS",
        ]
    );
    assert_eq!(
        events[2].event_data.custom_str(keys::NOTE),
        Some("no holdings located")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_cancel_fans_out_to_suppliers_still_in_play() -> Result<()> {
    let harness = Harness::start(
        BrokerMode::Transparent,
        &[("ISIL:SUP1", 0, 1), ("ISIL:SUP2", 1, 1)],
    )
    .await;
    let intake = harness.broker.intake();

    let transaction = intake
        .request_received(request("cancel-1", "return-ISIL:SUP1;ISIL:SUP2"))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 1
        })
        .await?;

    // First supplier declines, the rota moves on to the second.
    intake
        .supplying_agency_message_received(supplier_says(
            "cancel-1",
            "ISIL:SUP1",
            SupplierStatus::Unfilled,
            ReasonForMessage::RequestResponse,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 2
        })
        .await?;

    // A late answer puts the first supplier back in play.
    intake
        .supplying_agency_message_received(supplier_says(
            "cancel-1",
            "ISIL:SUP1",
            SupplierStatus::WillSupply,
            ReasonForMessage::StatusChange,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-requester", "SUCCESS") == 1
        })
        .await?;

    intake
        .requesting_agency_message_received(requester_says(
            "cancel-1",
            "ISIL:SUP2",
            RequesterAction::Cancel,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 3
        })
        .await?;

    intake
        .supplying_agency_message_received(supplier_says(
            "cancel-1",
            "ISIL:SUP2",
            SupplierStatus::Cancelled,
            ReasonForMessage::CancelResponse,
        ))
        .await?;
    let events = harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 4
        })
        .await?;

    let fan_out = events
        .iter()
        .rfind(|event| event.event_name == EventName::MessageSupplier)
        .expect("cancel task created");
    assert_eq!(fan_out.event_data.custom_str(keys::SUPPLIER_SYMBOL), Some("ISIL:SUP1"));
    assert_eq!(fan_out.event_data.custom_str(keys::ACTION), Some("Cancel"));

    let sent = harness.sender.sent().await;
    let (to, message) = sent.last().expect("cancel delivered");
    assert_eq!(to, "ISIL:SUP1");
    assert_eq!(message.requester_action(), Some(RequesterAction::Cancel));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opaque_cancel_is_routed_to_the_selected_supplier_only() -> Result<()> {
    let harness = Harness::start(
        BrokerMode::Opaque,
        &[("ISIL:SUP1", 0, 1), ("ISIL:SUP2", 1, 1)],
    )
    .await;
    let intake = harness.broker.intake();

    let transaction = intake
        .request_received(request("cancel-2", "return-ISIL:SUP1;ISIL:SUP2"))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 1
        })
        .await?;

    intake
        .requesting_agency_message_received(requester_says(
            "cancel-2",
            BROKER,
            RequesterAction::Cancel,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 2
        })
        .await?;

    intake
        .supplying_agency_message_received(supplier_says(
            "cancel-2",
            "ISIL:SUP1",
            SupplierStatus::Cancelled,
            ReasonForMessage::CancelResponse,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-requester", "SUCCESS") == 1
        })
        .await?;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let events = harness.events(transaction.id).await;
    assert_eq!(count(&events, "message-supplier", "SUCCESS"), 2);
    assert_eq!(count(&events, "select-supplier", "SUCCESS"), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_request_is_rejected() -> Result<()> {
    let harness = Harness::start(BrokerMode::Opaque, &[("ISIL:SUP", 0, 1)]).await;
    let intake = harness.broker.intake();

    intake
        .request_received(request("dup-1", "return-ISIL:SUP"))
        .await?;
    let second = intake
        .request_received(request("dup-1", "return-ISIL:SUP"))
        .await;
    assert!(matches!(
        second,
        Err(illbroker_core::BrokerError::Conflict(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_unfilled_from_a_skipped_supplier_keeps_the_selection() -> Result<()> {
    let harness = Harness::start(
        BrokerMode::Transparent,
        &[("ISIL:SUP1", 0, 1), ("ISIL:SUP2", 1, 1), ("ISIL:SUP3", 2, 1)],
    )
    .await;
    let intake = harness.broker.intake();

    let transaction = intake
        .request_received(request("late-1", "return-ISIL:SUP1;ISIL:SUP2;ISIL:SUP3"))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 1
        })
        .await?;

    intake
        .supplying_agency_message_received(supplier_says(
            "late-1",
            "ISIL:SUP1",
            SupplierStatus::Unfilled,
            ReasonForMessage::RequestResponse,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 2
        })
        .await?;

    intake
        .supplying_agency_message_received(supplier_says(
            "late-1",
            "ISIL:SUP2",
            SupplierStatus::WillSupply,
            ReasonForMessage::RequestResponse,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "message-requester", "SUCCESS") == 1
        })
        .await?;

    // SUP1 repeats its answer after the request has moved on.
    intake
        .supplying_agency_message_received(supplier_says(
            "late-1",
            "ISIL:SUP1",
            SupplierStatus::Unfilled,
            ReasonForMessage::StatusChange,
        ))
        .await?;
    harness
        .wait_until(transaction.id, |events| {
            count(events, "supplier-msg-received", "SUCCESS") == 3
        })
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let rota: Vec<_> = LocatedSupplierRepository::list(harness.db.as_ref(), transaction.id)
        .await?
        .into_iter()
        .map(|row| (row.supplier_symbol, row.supplier_status))
        .collect();
    assert_eq!(
        rota,
        [
            ("ISIL:SUP1".to_string(), SupplierSelection::Skipped),
            ("ISIL:SUP2".to_string(), SupplierSelection::Selected),
            ("ISIL:SUP3".to_string(), SupplierSelection::New),
        ]
    );

    let events = harness.events(transaction.id).await;
    assert_eq!(count(&events, "select-supplier", "SUCCESS"), 2);
    assert_eq!(count(&events, "message-supplier", "SUCCESS"), 2);
    let sent = harness.sender.sent().await;
    assert!(sent.iter().all(|(to, _)| to != "ISIL:SUP3"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_supplier_is_reported_and_the_rota_moves_on() -> Result<()> {
    let harness = Harness::start_with_sender(
        BrokerMode::Transparent,
        &[("ISIL:SUP1", 0, 1), ("ISIL:SUP2", 1, 1)],
        RecordingSender::unreachable(&["ISIL:SUP1"]),
    )
    .await;
    let log_cancel = CancellationToken::new();
    let notification_log = harness.broker.spawn_notification_log(log_cancel.clone());
    let mut notifications = harness.broker.subscribe_notifications();
    let intake = harness.broker.intake();

    let transaction = intake
        .request_received(request("down-1", "return-ISIL:SUP1;ISIL:SUP2"))
        .await?;
    let events = harness
        .wait_until(transaction.id, |events| {
            count(events, "message-supplier", "SUCCESS") == 1
        })
        .await?;

    assert_eq!(
        history(&events),
        [
            "request-received SUCCESS",
            "locate-suppliers SUCCESS",
            "select-supplier SUCCESS",
            "message-supplier ERROR",
            "message-requester SUCCESS",
            "select-supplier SUCCESS",
            "message-supplier SUCCESS",
        ]
    );
    assert_eq!(events[4].event_data.custom_str(keys::STATUS), Some("Unfilled"));

    let notified = notifications.recv().await?;
    assert_eq!(notified.status, Some(SupplierStatus::Unfilled));
    assert_eq!(notified.participants, ["ISIL:SUP2"]);

    let sent = harness.sender.sent().await;
    let targets: Vec<_> = sent.iter().map(|(to, _)| to.as_str()).collect();
    assert_eq!(targets, [common::REQUESTER, "ISIL:SUP2"]);
    assert_eq!(sent[0].1.supplier_status(), Some(SupplierStatus::Unfilled));

    let first =
        LocatedSupplierRepository::find_by_symbol(harness.db.as_ref(), transaction.id, "ISIL:SUP1")
            .await?
            .expect("first candidate kept");
    assert_eq!(first.last_status, Some(SupplierStatus::Unfilled));

    log_cancel.cancel();
    assert_eq!(notification_log.await?, 1);
    Ok(())
}
