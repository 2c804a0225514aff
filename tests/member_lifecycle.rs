//! End-to-end lifecycle over the assembled service graph: signup, deposit,
//! commissions, transfer, withdrawal, archival.

use upline::activation::build_services;
use upline::config::Config;
use upline::ledger::TransferRequest;
use upline::model::FundingStatus;
use upline::placement::{OnboardRequest, SponsorRef};

#[tokio::test]
async fn full_member_lifecycle() {
    let services = build_services(&Config::for_test()).await.unwrap();

    // Signup chain: sponsor under root, member under sponsor.
    let (sponsor, _) = services
        .placement
        .onboard(OnboardRequest {
            sponsor: SponsorRef::Root,
            designee: None,
        })
        .await
        .unwrap();
    let (member, placement) = services
        .placement
        .onboard(OnboardRequest {
            sponsor: SponsorRef::Code(sponsor.referral_code.clone()),
            designee: None,
        })
        .await
        .unwrap();
    assert_eq!(placement.parent, sponsor.id);

    // First deposit: verified, activates the member, pays the sponsor 10%.
    let deposit = services
        .activation
        .record_deposit(member.id, 100_000, "USD", "admin")
        .await
        .unwrap();
    assert_eq!(deposit.status, FundingStatus::Pending);
    let verified = services
        .activation
        .verify_and_activate(deposit.id, "admin")
        .await
        .unwrap();
    assert_eq!(verified.status, FundingStatus::Verified);

    let activated = services.stores.members.get(member.id).await.unwrap();
    assert!(activated.active);
    assert_eq!(activated.package_minor, 100_000);

    let sponsor_balance = services.ledger.get_balance(sponsor.id).await.unwrap();
    assert_eq!(sponsor_balance.available_minor, 10_000);
    assert_eq!(sponsor_balance.lifetime_minor, 10_000);

    // Sponsor transfers part of the bonus back to the member, OTP-gated.
    let code = services.ledger.request_transfer_otp(sponsor.id).await.unwrap();
    services
        .ledger
        .transfer(TransferRequest {
            sender: sponsor.id,
            recipient: member.id,
            amount_minor: 4_000,
            otp_code: code,
        })
        .await
        .unwrap();
    assert_eq!(
        services
            .ledger
            .get_balance(member.id)
            .await
            .unwrap()
            .available_minor,
        4_000
    );

    // Sponsor withdraws the rest after KYC.
    services
        .stores
        .members
        .set_kyc(sponsor.id, true)
        .await
        .unwrap();
    let withdrawal = services
        .ledger
        .request_withdrawal(sponsor.id, 6_000, "admin")
        .await
        .unwrap();
    services.ledger.approve_withdrawal(withdrawal.id).await.unwrap();
    let sponsor_balance = services.ledger.get_balance(sponsor.id).await.unwrap();
    assert_eq!(sponsor_balance.available_minor, 0);
    assert_eq!(sponsor_balance.lifetime_minor, 10_000);

    // Everyone's ledger still replays to their stored balance.
    for owner in [sponsor.id, member.id] {
        assert!(services.ledger.reconcile(owner).await.unwrap().consistent());
    }

    // The member (childless) can be archived; remaining funds sweep to root.
    let tombstone = services
        .activation
        .archive_member(member.id, "admin")
        .await
        .unwrap();
    assert_eq!(tombstone.swept_minor, 4_000);
    let root = services.stores.members.get_root().await.unwrap();
    assert_eq!(
        services
            .ledger
            .get_balance(root.id)
            .await
            .unwrap()
            .available_minor,
        4_000
    );
}
