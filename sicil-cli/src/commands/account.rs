//! `sicil account` and `sicil refer` commands - Inspect and adjust the ledger

use anyhow::Result;
use sicil_core::{Config, ReferralCoordinator};
use tracing::info;

use super::open_ledger;

/// Show one user's counters, creating the account if needed
pub async fn show(config: Config, user_id: i64, json_output: bool) -> Result<()> {
    let ledger = open_ledger(&config).await?;
    let referrals = ReferralCoordinator::new(ledger, &config.referral.link_prefix);
    let status = referrals.invite_status(user_id).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let account = &status.account;
    println!("╭─────────────────────────────────────────╮");
    println!("│  User {:<33} │", account.user_id);
    println!("├─────────────────────────────────────────┤");
    println!("│  Remaining lookups:  {:>10}         │", account.remaining_searches);
    println!("│  Invited users:      {:>10}         │", account.invited_users);
    println!("│  Total invites:      {:>10}         │", account.total_invites);
    println!(
        "│  Bonus received:     {:>10}         │",
        if account.bonus_received { "yes" } else { "no" }
    );
    if !account.bonus_received {
        println!(
            "│  Invites to bonus:   {:>10}         │",
            status.invites_needed
        );
    }
    println!("╰─────────────────────────────────────────╯");

    if let Some(link) = &status.invite_link {
        println!("\n🔗 Invite link: {}", link);
    }

    Ok(())
}

/// Show ledger totals
pub async fn stats(config: Config, json_output: bool) -> Result<()> {
    let ledger = open_ledger(&config).await?;
    let stats = ledger.stats().await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("╭─────────────────────────────────────────╮");
    println!("│           Sicil Ledger Totals           │");
    println!("├─────────────────────────────────────────┤");
    println!("│  Users:              {:>10}         │", stats.users);
    println!("│  Remaining lookups:  {:>10}         │", stats.remaining_searches);
    println!("│  Invites counted:    {:>10}         │", stats.total_invites);
    println!("│  Bonuses granted:    {:>10}         │", stats.bonuses_granted);
    println!("╰─────────────────────────────────────────╯");

    Ok(())
}

/// Credit a referrer for a referred user
pub async fn refer(config: Config, referrer_id: i64, referred_id: i64) -> Result<()> {
    let ledger = open_ledger(&config).await?;
    let referrals = ReferralCoordinator::new(ledger.clone(), &config.referral.link_prefix);

    let bonus_granted = referrals.on_referral(referrer_id, referred_id).await?;
    let Some(account) = ledger.account(referrer_id).await? else {
        println!(
            "⚠️  User {} has no account yet; referral ignored.",
            referrer_id
        );
        return Ok(());
    };

    if bonus_granted {
        println!(
            "🎉 User {} reached {} invites and received {} extra lookups.",
            referrer_id,
            ledger.bonus_threshold(),
            ledger.bonus_amount()
        );
    }
    println!(
        "User {}: {} invite(s), {} lookup(s) left",
        referrer_id, account.invited_users, account.remaining_searches
    );

    info!("Referral {} -> {} processed", referrer_id, referred_id);
    Ok(())
}
