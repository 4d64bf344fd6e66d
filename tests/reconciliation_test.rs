mod common;

use chrono::{Duration, Utc};
use common::*;
use quorum::{
    domain::{
        CompletionOutcome, Confirmation, ConfirmationSource, GatewaySubRecord, MembershipStatus,
        PaymentLookup, PaymentMethod, PaymentStatus, ProfileMembershipStatus, SubRecordStatus,
    },
    error::AppError,
    integrations::IntegrationEvent,
    payments::GatewayInitiation,
    repository::{GatewayRecordRepository, MembershipRepository, PaymentRepository, ProfileRepository},
};
use uuid::Uuid;

fn confirmation(lookup: PaymentLookup, receipt: &str, source: ConfirmationSource) -> Confirmation {
    Confirmation {
        lookup,
        receipt_code: Some(receipt.to_string()),
        amount_confirmed: Some(500),
        result_code: Some("0".to_string()),
        result_description: None,
        source,
    }
}

#[tokio::test]
async fn test_initiation_creates_pending_payment_and_membership() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();

    let payment = app.initiate_mpesa(payer).await?;
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.currency, "KES");
    assert!(payment.external_ref.as_deref().is_some_and(|r| r.starts_with("ws_CO_")));

    let membership_id = payment.membership_id.expect("membership linked at initiation");
    let membership = app.ctx.membership_repo.find_by_id(membership_id).await?.unwrap();
    assert_eq!(membership.status, MembershipStatus::Pending);
    assert_eq!(membership.owner_id, payer);

    match app.ctx.gateway_record_repo.find_for_payment(&payment).await? {
        Some(GatewaySubRecord::Mpesa(tx)) => {
            assert_eq!(tx.status, SubRecordStatus::Accepted);
            assert_eq!(tx.checkout_request_id, payment.external_ref);
            assert_eq!(tx.phone_number, PHONE);
        }
        other => panic!("unexpected sub-record {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_invalid_phone_creates_nothing() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let mut request = app.initiate_request(payer, PaymentMethod::Mpesa);
    request.phone_number = Some("0712345678".to_string());

    let result = app.ctx.payment_service.initiate(request).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(app.ctx.payment_repo.find_by_payer(payer).await?.is_empty());
    assert_eq!(app.mpesa.initiate_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_amount_over_ceiling_creates_nothing() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let mut request = app.initiate_request(payer, PaymentMethod::Mpesa);
    request.amount = 200_000;

    let result = app.ctx.payment_service.initiate(request).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(app.ctx.payment_repo.find_by_payer(payer).await?.is_empty());
    assert_eq!(app.mpesa.initiate_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_manual_receipt_bound_elsewhere_conflicts() -> anyhow::Result<()> {
    let app = setup().await?;
    let first = app.initiate_mpesa(Uuid::new_v4()).await?;
    let payer = Uuid::new_v4();
    let second = app.initiate_mpesa(payer).await?;

    let body = stk_success_body(first.external_ref.as_deref().unwrap(), "R123ABCDEF", 500);
    app.ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&first, body))
        .await?;

    let result = app.ctx.payment_service.verify_manual(second.id, payer, "R123ABCDEF").await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let second = app.ctx.payment_repo.find_by_id(second.id).await?.unwrap();
    assert_eq!(second.status, PaymentStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_webhook_completes_and_replay_is_idempotent() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;
    let checkout = payment.external_ref.clone().unwrap();

    let body = stk_success_body(&checkout, "NLJ7RT61SV", 500);
    app.ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&payment, body.clone()))
        .await?;

    let completed = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(completed.status, PaymentStatus::Completed);
    assert_eq!(completed.receipt_code.as_deref(), Some("NLJ7RT61SV"));
    assert!(completed.completed_at.is_some());

    let membership = app.ctx.membership_repo.find_by_id(payment.membership_id.unwrap()).await?.unwrap();
    assert_eq!(membership.status, MembershipStatus::Active);
    assert_eq!(membership.source_payment_id, Some(payment.id));
    let number = membership.membership_number.clone().unwrap();
    assert!(number.starts_with("ESA-"));
    let term = membership.end_at.unwrap() - membership.start_at.unwrap();
    assert_eq!(term.num_days(), 365);

    // Provider retries the same callback.
    app.ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&payment, body))
        .await?;

    let replayed = app.ctx.membership_repo.find_by_id(membership.id).await?.unwrap();
    assert_eq!(replayed.end_at, membership.end_at);
    assert_eq!(replayed.membership_number.as_deref(), Some(number.as_str()));

    let profile = app.ctx.profile_repo.find(payer).await?.unwrap();
    assert_eq!(profile.membership_status, ProfileMembershipStatus::Active);
    assert_eq!(profile.membership_number.as_deref(), Some(number.as_str()));

    assert_eq!(app.recorder.wait_for("membership_activated", 1).await, 1);
    assert_eq!(app.recorder.wait_for("payment_completed", 1).await, 1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(app.recorder.count("membership_activated"), 1);
    Ok(())
}

#[tokio::test]
async fn test_completion_notice_carries_payer_contact() -> anyhow::Result<()> {
    let app = setup().await?;
    let payment = app.initiate_mpesa(Uuid::new_v4()).await?;
    assert_eq!(payment.contact_email.as_deref(), Some("payer@students.example.ac.ke"));

    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(payment.id), "MAIL000001", ConfirmationSource::Webhook))
        .await?;
    assert_eq!(app.recorder.wait_for("payment_completed", 1).await, 1);

    let membership = app.ctx.membership_repo.find_by_id(payment.membership_id.unwrap()).await?.unwrap();
    let notice = app
        .recorder
        .events()
        .into_iter()
        .find(|e| e.kind() == "payment_completed")
        .unwrap();
    match notice {
        IntegrationEvent::PaymentCompleted { contact_email, membership_number, .. } => {
            assert_eq!(contact_email.as_deref(), Some("payer@students.example.ac.ke"));
            assert_eq!(membership_number, membership.membership_number);
        }
        other => panic!("unexpected event {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_poll_and_webhook_with_same_receipt_activate_once() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;

    app.mpesa.push_status(Ok(succeeded("QAB12CD34E", 500)));
    let polled = app.ctx.payment_service.poll(payment.id, payer).await?;
    assert_eq!(polled.status, PaymentStatus::Completed);

    let body = stk_success_body(payment.external_ref.as_deref().unwrap(), "QAB12CD34E", 500);
    app.ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&payment, body))
        .await?;

    let memberships = app.ctx.membership_repo.list_by_owner(payer).await?;
    assert_eq!(memberships.len(), 1);
    assert_eq!(app.recorder.wait_for("payment_completed", 1).await, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_completions_activate_exactly_once() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;
    let lookup = PaymentLookup::ExternalRef(payment.external_ref.clone().unwrap());

    let reconciler = app.ctx.reconciler.clone();
    let first = {
        let reconciler = reconciler.clone();
        let c = confirmation(lookup.clone(), "RACE000001", ConfirmationSource::Webhook);
        tokio::spawn(async move { reconciler.complete(c).await })
    };
    let second = {
        let reconciler = reconciler.clone();
        let c = confirmation(lookup.clone(), "RACE000001", ConfirmationSource::Poll);
        tokio::spawn(async move { reconciler.complete(c).await })
    };

    let outcomes = [first.await??, second.await??];
    let applied = outcomes.iter().filter(|o| o.applied()).count();
    assert_eq!(applied, 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, CompletionOutcome::AlreadyCompleted(_))));

    assert_eq!(app.recorder.wait_for("membership_activated", 1).await, 1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(app.recorder.count("membership_activated"), 1);
    Ok(())
}

#[tokio::test]
async fn test_receipt_already_used_by_another_payment_conflicts() -> anyhow::Result<()> {
    let app = setup().await?;
    let first = app.initiate_mpesa(Uuid::new_v4()).await?;
    let second = app.initiate_mpesa(Uuid::new_v4()).await?;

    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(first.id), "DUP0000001", ConfirmationSource::Webhook))
        .await?;

    let result = app
        .ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(second.id), "DUP0000001", ConfirmationSource::Manual))
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let second = app.ctx.payment_repo.find_by_id(second.id).await?.unwrap();
    assert_eq!(second.status, PaymentStatus::Pending);
    assert!(second.receipt_code.is_none());
    Ok(())
}

#[tokio::test]
async fn test_different_receipt_for_completed_payment_conflicts() -> anyhow::Result<()> {
    let app = setup().await?;
    let payment = app.initiate_mpesa(Uuid::new_v4()).await?;

    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(payment.id), "FIRST00001", ConfirmationSource::Webhook))
        .await?;
    let result = app
        .ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(payment.id), "OTHER00001", ConfirmationSource::Poll))
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let payment = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(payment.receipt_code.as_deref(), Some("FIRST00001"));
    Ok(())
}

#[tokio::test]
async fn test_amount_mismatch_is_rejected() -> anyhow::Result<()> {
    let app = setup().await?;
    let payment = app.initiate_mpesa(Uuid::new_v4()).await?;

    let body = stk_success_body(payment.external_ref.as_deref().unwrap(), "LOW0000001", 5);
    let result = app
        .ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&payment, body))
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let payment = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_failure_callback_fails_payment_and_late_success_is_absorbed() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;
    let checkout = payment.external_ref.clone().unwrap();

    let body = stk_failure_body(&checkout, 1032, "Request cancelled by user");
    app.ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&payment, body))
        .await?;

    let failed = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("Request cancelled by user"));
    assert_eq!(app.recorder.wait_for("payment_failed", 1).await, 1);

    let outcome = app
        .ctx
        .reconciler
        .complete(confirmation(PaymentLookup::ExternalRef(checkout), "LATE000001", ConfirmationSource::Poll))
        .await?;
    assert!(matches!(outcome, CompletionOutcome::AlreadyTerminal(_)));

    let still_failed = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(still_failed.status, PaymentStatus::Failed);
    let membership = app.ctx.membership_repo.find_by_id(payment.membership_id.unwrap()).await?.unwrap();
    assert_eq!(membership.status, MembershipStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_still_processing_poll_leaves_payment_pending() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;

    app.mpesa.push_status(Ok(quorum::payments::GatewayStatus::pending(
        "The transaction is being processed",
    )));
    let polled = app.ctx.payment_service.poll(payment.id, payer).await?;
    assert_eq!(polled.status, PaymentStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_transport_error_never_fails_payment() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;

    app.mpesa.push_status(Err(AppError::Transport("connection reset".to_string())));
    let result = app.ctx.payment_service.poll(payment.id, payer).await;
    assert!(matches!(result, Err(AppError::Transport(_))));

    let payment = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_declined_poll_fails_payment() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;

    app.mpesa.push_status(Ok(failed("1", "The balance is insufficient for the transaction")));
    let polled = app.ctx.payment_service.poll(payment.id, payer).await?;
    assert_eq!(polled.status, PaymentStatus::Failed);

    match app.ctx.gateway_record_repo.find_for_payment(&polled).await? {
        Some(GatewaySubRecord::Mpesa(tx)) => {
            assert_eq!(tx.status, SubRecordStatus::Failed);
            assert_eq!(tx.result_code.as_deref(), Some("1"));
        }
        other => panic!("unexpected sub-record {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_gateway_rejection_fails_payment_but_transport_keeps_it_open() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();

    app.mpesa.push_initiation(Err(AppError::GatewayRejected("Invalid Access Token".to_string())));
    let result = app
        .ctx
        .payment_service
        .initiate(app.initiate_request(payer, PaymentMethod::Mpesa))
        .await;
    assert!(matches!(result, Err(AppError::GatewayRejected(_))));

    app.mpesa.push_initiation(Err(AppError::Transport("timed out".to_string())));
    let result = app
        .ctx
        .payment_service
        .initiate(app.initiate_request(payer, PaymentMethod::Mpesa))
        .await;
    assert!(matches!(result, Err(AppError::Transport(_))));

    let mut statuses: Vec<PaymentStatus> = app
        .ctx
        .payment_repo
        .find_by_payer(payer)
        .await?
        .into_iter()
        .map(|p| p.status)
        .collect();
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![PaymentStatus::Failed, PaymentStatus::Pending]);
    Ok(())
}

#[tokio::test]
async fn test_callback_before_initiation_returns() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();

    // The initiate call times out on our side although the provider took it.
    app.mpesa.push_initiation(Err(AppError::Transport("timed out".to_string())));
    let _ = app
        .ctx
        .payment_service
        .initiate(app.initiate_request(payer, PaymentMethod::Mpesa))
        .await;
    let payment = app.ctx.payment_repo.find_by_payer(payer).await?.remove(0);
    assert!(payment.external_ref.is_none());

    let body = stk_success_body("ws_CO_EARLY", "EARLY00001", 500);
    app.ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&payment, body))
        .await?;

    let completed = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(completed.status, PaymentStatus::Completed);
    assert_eq!(completed.external_ref.as_deref(), Some("ws_CO_EARLY"));

    // A late acknowledgement carrying the same reference changes nothing.
    let initiation = GatewayInitiation {
        external_ref: "ws_CO_EARLY".to_string(),
        secondary_ref: None,
        approval_url: None,
        customer_message: None,
    };
    let after = app.ctx.reconciler.gateway_accepted(payment.id, &initiation).await?;
    assert_eq!(after.status, PaymentStatus::Completed);

    let other = GatewayInitiation { external_ref: "ws_CO_OTHER".to_string(), ..initiation };
    assert!(matches!(
        app.ctx.reconciler.gateway_accepted(payment.id, &other).await,
        Err(AppError::Conflict(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_bad_signature_is_unauthorized() -> anyhow::Result<()> {
    let app = setup().await?;
    let payment = app.initiate_mpesa(Uuid::new_v4()).await?;

    let body = stk_success_body(payment.external_ref.as_deref().unwrap(), "FORGED0001", 500);
    let mut webhook = app.mpesa_callback(&payment, body);
    webhook.query.insert("sig".to_string(), "00".repeat(32));

    let result = app.ctx.payment_service.handle_webhook(PaymentMethod::Mpesa, webhook).await;
    assert!(matches!(result, Err(AppError::Unauthorized)));

    let payment = app.ctx.payment_repo.find_by_id(payment.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_manual_verification_then_webhook() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;

    let outcome = app
        .ctx
        .payment_service
        .verify_manual(payment.id, payer, " qhr4tt7zmx ")
        .await?;
    assert!(outcome.applied());
    assert_eq!(outcome.payment().receipt_code.as_deref(), Some("QHR4TT7ZMX"));

    let body = stk_success_body(payment.external_ref.as_deref().unwrap(), "QHR4TT7ZMX", 500);
    app.ctx
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, app.mpesa_callback(&payment, body))
        .await?;

    // Someone else's payment cannot be verified by this payer.
    let stranger = Uuid::new_v4();
    let result = app.ctx.payment_service.verify_manual(payment.id, stranger, "QHR4TT7ZMX").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_cancel_open_payment_and_refuse_settled_one() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let open = app.initiate_mpesa(payer).await?;

    let cancelled = app.ctx.payment_service.cancel(open.id, payer).await?;
    assert_eq!(cancelled.status, PaymentStatus::Cancelled);
    let membership = app.ctx.membership_repo.find_by_id(open.membership_id.unwrap()).await?.unwrap();
    assert_eq!(membership.status, MembershipStatus::Cancelled);

    let paid = app.initiate_mpesa(payer).await?;
    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(paid.id), "PAID000001", ConfirmationSource::Webhook))
        .await?;
    let result = app.ctx.payment_service.cancel(paid.id, payer).await;
    assert!(matches!(result, Err(AppError::AlreadyTerminal(_))));
    Ok(())
}

#[tokio::test]
async fn test_refund_cancels_membership() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;
    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(payment.id), "REFUND0001", ConfirmationSource::Webhook))
        .await?;

    let refunded = app.ctx.payment_service.refund(payment.id, "duplicate purchase").await?;
    assert_eq!(refunded.status, PaymentStatus::Refunded);

    let membership = app.ctx.membership_repo.find_by_id(payment.membership_id.unwrap()).await?.unwrap();
    assert_eq!(membership.status, MembershipStatus::Cancelled);
    let profile = app.ctx.profile_repo.find(payer).await?.unwrap();
    assert_eq!(profile.membership_status, ProfileMembershipStatus::Cancelled);

    // Refunded is terminal; a late confirmation does not revive it.
    let outcome = app
        .ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(payment.id), "REFUND0001", ConfirmationSource::Poll))
        .await?;
    assert!(matches!(outcome, CompletionOutcome::AlreadyTerminal(_)));
    assert!(matches!(
        app.ctx.payment_service.refund(payment.id, "again").await,
        Err(AppError::AlreadyTerminal(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_gift_purchase_records_referral_once() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let friend = Uuid::new_v4();

    let mut request = app.initiate_request(payer, PaymentMethod::Mpesa);
    request.beneficiary_id = Some(friend);
    let payment = app.ctx.payment_service.initiate(request).await?.payment;

    let c = confirmation(PaymentLookup::Id(payment.id), "GIFT000001", ConfirmationSource::Webhook);
    app.ctx.reconciler.complete(c.clone()).await?;
    app.ctx.reconciler.complete(c).await?;

    let membership = app.ctx.membership_repo.find_by_id(payment.membership_id.unwrap()).await?.unwrap();
    assert_eq!(membership.owner_id, friend);
    assert_eq!(membership.gifted_by, Some(payer));
    assert_eq!(membership.status, MembershipStatus::Active);

    let referrals = app.ctx.membership_repo.list_referrals_by_payer(payer).await?;
    assert_eq!(referrals.len(), 1);
    assert_eq!(referrals[0].membership_id, membership.id);

    assert!(app.ctx.profile_repo.find(friend).await?.is_some());
    assert!(app.ctx.membership_repo.list_by_owner(payer).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_renewal_supersedes_and_keeps_number() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();

    let first = app.initiate_mpesa(payer).await?;
    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(first.id), "TERM000001", ConfirmationSource::Webhook))
        .await?;
    let second = app.initiate_mpesa(payer).await?;
    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(second.id), "TERM000002", ConfirmationSource::Webhook))
        .await?;

    let old = app.ctx.membership_repo.find_by_id(first.membership_id.unwrap()).await?.unwrap();
    let new = app.ctx.membership_repo.find_by_id(second.membership_id.unwrap()).await?.unwrap();
    assert_eq!(old.status, MembershipStatus::Expired);
    assert_eq!(new.status, MembershipStatus::Active);
    assert_eq!(old.membership_number, new.membership_number);

    let active = app
        .ctx
        .membership_repo
        .list_by_owner(payer)
        .await?
        .into_iter()
        .filter(|m| m.status == MembershipStatus::Active)
        .count();
    assert_eq!(active, 1);
    Ok(())
}

#[tokio::test]
async fn test_lapsed_membership_expires_on_read() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;
    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(payment.id), "OLD0000001", ConfirmationSource::Webhook))
        .await?;

    let past = (Utc::now() - Duration::days(1)).naive_utc();
    sqlx::query("UPDATE memberships SET end_at = ? WHERE id = ?")
        .bind(past)
        .bind(payment.membership_id.unwrap().to_string())
        .execute(&app.pool)
        .await?;

    let overview = app.ctx.membership_service.overview(payer).await?;
    assert!(overview.current.is_none());
    assert_eq!(overview.history[0].status, MembershipStatus::Expired);
    assert_eq!(
        overview.profile.map(|p| p.membership_status),
        Some(ProfileMembershipStatus::Expired)
    );
    Ok(())
}

#[tokio::test]
async fn test_admin_cancels_active_membership_only() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();
    let payment = app.initiate_mpesa(payer).await?;
    let membership_id = payment.membership_id.unwrap();

    assert!(matches!(
        app.ctx.membership_service.cancel(membership_id).await,
        Err(AppError::BadRequest(_))
    ));

    app.ctx
        .reconciler
        .complete(confirmation(PaymentLookup::Id(payment.id), "ADMIN00001", ConfirmationSource::Webhook))
        .await?;
    let cancelled = app.ctx.membership_service.cancel(membership_id).await?;
    assert_eq!(cancelled.status, MembershipStatus::Cancelled);

    let profile = app.ctx.profile_repo.find(payer).await?.unwrap();
    assert_eq!(profile.membership_status, ProfileMembershipStatus::Cancelled);
    Ok(())
}

#[tokio::test]
async fn test_wallet_capture_completes_payment() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();

    let initiated = app
        .ctx
        .payment_service
        .initiate(app.initiate_request(payer, PaymentMethod::PayPal))
        .await?;
    assert_eq!(initiated.payment.status, PaymentStatus::Processing);
    assert_eq!(initiated.payment.currency, "USD");
    assert!(initiated.approval_url.is_some());

    app.paypal.push_status(Ok(succeeded("3C679366HH908993F", 500)));
    let captured = app.ctx.payment_service.capture(initiated.payment.id, payer).await?;
    assert_eq!(captured.status, PaymentStatus::Completed);
    assert_eq!(captured.receipt_code.as_deref(), Some("3C679366HH908993F"));

    match app.ctx.gateway_record_repo.find_for_payment(&captured).await? {
        Some(GatewaySubRecord::Wallet(order)) => {
            assert_eq!(order.capture_status, SubRecordStatus::Completed);
            assert_eq!(order.capture_id.as_deref(), Some("3C679366HH908993F"));
        }
        other => panic!("unexpected sub-record {:?}", other),
    }

    // Manual receipt entry is a push-payment feature.
    assert!(matches!(
        app.ctx.payment_service.verify_manual(captured.id, payer, "ABC").await,
        Err(AppError::BadRequest(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_reaper_cancels_abandoned_and_resolves_answered() -> anyhow::Result<()> {
    let app = setup().await?;
    let payer = Uuid::new_v4();

    let abandoned = app.initiate_mpesa(payer).await?;
    let answered = app.initiate_mpesa(payer).await?;
    let unreachable = app.initiate_mpesa(payer).await?;
    let fresh = app.initiate_mpesa(payer).await?;

    let old = (Utc::now() - Duration::hours(2)).naive_utc();
    for id in [abandoned.id, answered.id, unreachable.id] {
        sqlx::query("UPDATE payments SET created_at = ? WHERE id = ?")
            .bind(old)
            .bind(id.to_string())
            .execute(&app.pool)
            .await?;
    }

    // All three share a timestamp, so only the tally of outcomes is fixed.
    app.mpesa.push_status(Ok(quorum::payments::GatewayStatus::pending("no answer")));
    app.mpesa.push_status(Ok(succeeded("SWEEP00001", 500)));
    app.mpesa.push_status(Err(AppError::Transport("timeout".to_string())));

    let report = app.ctx.reaper.run_once().await?;
    assert_eq!(report.examined, 3);
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.skipped, 1);

    let fresh = app.ctx.payment_repo.find_by_id(fresh.id).await?.unwrap();
    assert_eq!(fresh.status, PaymentStatus::Pending);

    let mut settled: Vec<PaymentStatus> = Vec::new();
    for id in [abandoned.id, answered.id, unreachable.id] {
        settled.push(app.ctx.payment_repo.find_by_id(id).await?.unwrap().status);
    }
    settled.sort_by_key(|s| s.as_str());
    assert_eq!(
        settled,
        vec![PaymentStatus::Cancelled, PaymentStatus::Completed, PaymentStatus::Pending]
    );
    Ok(())
}
