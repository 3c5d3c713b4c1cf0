use std::sync::Arc;

use cyder_tools::log::{debug, error, warn};
use strum::Display;
use thiserror::Error;

use crate::database::token::Token;
use crate::service::batch::{BatchUpdateType, BatchUpdater};
use crate::service::notify::{email_template, Notifier};
use crate::service::store::{AccountStore, ChannelDirectory, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FundsScope {
    Token,
    Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("quota must not be negative")]
    NegativeQuota,
    #[error("token #{0} not found")]
    UnknownToken(i64),
    #[error("insufficient {0} quota")]
    InsufficientFunds(FundsScope),
    #[error("failed to persist quota change")]
    PersistenceFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowBalance {
    RunningLow,
    UsedUp,
}

/// Which reminder, if any, a balance change from `before` to `after` triggers.
pub fn low_balance_crossing(before: i64, after: i64, threshold: i64) -> Option<LowBalance> {
    if before > 0 && after <= 0 {
        Some(LowBalance::UsedUp)
    } else if before >= threshold && after < threshold {
        Some(LowBalance::RunningLow)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub remind_threshold: i64,
    pub server_address: String,
    pub system_name: String,
}

pub struct QuotaLedger {
    tokens: Arc<dyn TokenStore>,
    accounts: Arc<dyn AccountStore>,
    directory: Arc<dyn ChannelDirectory>,
    notifier: Notifier,
    batch: Option<Arc<BatchUpdater>>,
    settings: LedgerSettings,
}

impl QuotaLedger {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        accounts: Arc<dyn AccountStore>,
        directory: Arc<dyn ChannelDirectory>,
        notifier: Notifier,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            tokens,
            accounts,
            directory,
            notifier,
            batch: None,
            settings,
        }
    }

    /// Routes every write through `batch` instead of the stores.
    pub fn with_batch(mut self, batch: Arc<BatchUpdater>) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn batch(&self) -> Option<&Arc<BatchUpdater>> {
        self.batch.as_ref()
    }

    async fn load_token(&self, token_id: i64) -> Result<Token, LedgerError> {
        match self.tokens.get_token(token_id).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(LedgerError::UnknownToken(token_id)),
            Err(e) => {
                error!("failed to load token #{}: {}", token_id, e);
                Err(LedgerError::PersistenceFailed)
            }
        }
    }

    async fn load_balance(&self, account_id: i64) -> Result<i64, LedgerError> {
        match self.accounts.get_account_quota(account_id).await {
            Ok(Some(quota)) => Ok(quota),
            Ok(None) => {
                error!("account #{} not found", account_id);
                Err(LedgerError::PersistenceFailed)
            }
            Err(e) => {
                error!("failed to load quota of account #{}: {}", account_id, e);
                Err(LedgerError::PersistenceFailed)
            }
        }
    }

    /// Reserves `estimate` against the token and its account before relaying.
    pub async fn pre_consume(&self, token_id: i64, estimate: i64) -> Result<(), LedgerError> {
        if estimate < 0 {
            return Err(LedgerError::NegativeQuota);
        }
        let token = self.load_token(token_id).await?;
        if !token.unlimited_quota && token.remain_quota < estimate {
            return Err(LedgerError::InsufficientFunds(FundsScope::Token));
        }
        let balance = self.load_balance(token.user_id).await?;
        if balance < estimate {
            return Err(LedgerError::InsufficientFunds(FundsScope::Account));
        }
        if estimate == 0 {
            return Ok(());
        }

        let after = match &self.batch {
            Some(batch) => self.reserve_batched(batch, &token, balance, estimate)?,
            None => self.reserve_direct(&token, estimate).await?,
        };
        self.remind_if_low(token.user_id, after + estimate, after);
        Ok(())
    }

    async fn reserve_direct(&self, token: &Token, estimate: i64) -> Result<i64, LedgerError> {
        if !token.unlimited_quota {
            match self.tokens.try_consume_token_quota(token.id, estimate).await {
                Ok(true) => {}
                Ok(false) => return Err(LedgerError::InsufficientFunds(FundsScope::Token)),
                Err(e) => {
                    error!("failed to charge token #{} {}: {}", token.id, estimate, e);
                    return Err(LedgerError::PersistenceFailed);
                }
            }
        }

        let result = self.accounts.try_consume_account_quota(token.user_id, estimate).await;
        let failure = match result {
            Ok(Some(after)) => return Ok(after),
            Ok(None) => LedgerError::InsufficientFunds(FundsScope::Account),
            Err(e) => {
                error!("failed to charge account #{} {}: {}", token.user_id, estimate, e);
                LedgerError::PersistenceFailed
            }
        };
        if !token.unlimited_quota {
            if let Err(e) = self.tokens.adjust_token_quota(token.id, estimate).await {
                error!(
                    "failed to refund token #{} (account #{}) {} after account charge failed: {}",
                    token.id, token.user_id, estimate, e
                );
            }
        }
        Err(failure)
    }

    fn reserve_batched(
        &self,
        batch: &BatchUpdater,
        token: &Token,
        stored_balance: i64,
        estimate: i64,
    ) -> Result<i64, LedgerError> {
        if !token.unlimited_quota
            && batch
                .try_reserve(BatchUpdateType::TokenQuota, token.id, token.remain_quota, estimate)
                .is_none()
        {
            return Err(LedgerError::InsufficientFunds(FundsScope::Token));
        }
        match batch.try_reserve(BatchUpdateType::AccountQuota, token.user_id, stored_balance, estimate) {
            Some(after) => Ok(after),
            None => {
                if !token.unlimited_quota {
                    batch.add(BatchUpdateType::TokenQuota, token.id, estimate);
                }
                Err(LedgerError::InsufficientFunds(FundsScope::Account))
            }
        }
    }

    /// Settles the difference between the real cost and the estimate.
    /// Positive charges, negative refunds.
    pub async fn post_consume(&self, token_id: i64, actual: i64) -> Result<(), LedgerError> {
        if actual == 0 {
            return Ok(());
        }
        let token = self.load_token(token_id).await?;

        if let Some(batch) = &self.batch {
            batch.add(BatchUpdateType::AccountQuota, token.user_id, -actual);
            if !token.unlimited_quota {
                batch.add(BatchUpdateType::TokenQuota, token.id, -actual);
            }
            return Ok(());
        }

        let mut failed = false;
        if let Err(e) = self.accounts.adjust_account_quota(token.user_id, -actual).await {
            error!(
                "failed to settle account #{} for token #{} by {}: {}",
                token.user_id, token.id, actual, e
            );
            failed = true;
        }
        if !token.unlimited_quota {
            if let Err(e) = self.tokens.adjust_token_quota(token.id, -actual).await {
                error!(
                    "failed to settle token #{} of account #{} by {}: {}",
                    token.id, token.user_id, actual, e
                );
                failed = true;
            }
        }
        if failed {
            Err(LedgerError::PersistenceFailed)
        } else {
            Ok(())
        }
    }

    /// Bumps usage counters of the account and channel after a served request.
    pub async fn record_usage(&self, account_id: i64, channel_id: i64, quota: i64) -> Result<(), LedgerError> {
        if let Some(batch) = &self.batch {
            batch.add(BatchUpdateType::AccountUsedQuota, account_id, quota);
            batch.add(BatchUpdateType::AccountRequestCount, account_id, 1);
            batch.add(BatchUpdateType::ChannelUsedQuota, channel_id, quota);
            return Ok(());
        }

        let mut failed = false;
        if let Err(e) = self.accounts.add_account_usage(account_id, quota, 1).await {
            error!("failed to record usage {} of account #{}: {}", quota, account_id, e);
            failed = true;
        }
        if quota != 0 {
            if let Err(e) = self.directory.add_channel_used_quota(channel_id, quota).await {
                error!("failed to record usage {} of channel #{}: {}", quota, channel_id, e);
                failed = true;
            }
        }
        if failed {
            Err(LedgerError::PersistenceFailed)
        } else {
            Ok(())
        }
    }

    fn remind_if_low(&self, account_id: i64, before: i64, after: i64) {
        let Some(level) = low_balance_crossing(before, after, self.settings.remind_threshold) else {
            return;
        };
        debug!("account #{} balance crossed into {:?}", account_id, level);
        let accounts = self.accounts.clone();
        let notifier = self.notifier.clone();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let email = match accounts.get_account(account_id).await {
                Ok(Some(account)) => account.email.filter(|e| !e.is_empty()),
                Ok(None) => None,
                Err(e) => {
                    error!("failed to fetch email of account #{}: {}", account_id, e);
                    None
                }
            };
            let Some(email) = email else {
                warn!("account #{} has no email, skipping balance reminder", account_id);
                return;
            };
            let (subject, content) = reminder_mail(&settings, level, after);
            notifier.notify_account(email, subject, content);
        });
    }
}

fn reminder_mail(settings: &LedgerSettings, level: LowBalance, balance: i64) -> (String, String) {
    let subject = "Credit Reminder";
    let headline = match level {
        LowBalance::UsedUp => "You've used up your credit.",
        LowBalance::RunningLow => "Your credit is running out soon!",
    };
    let top_up_link = format!("{}/topup", settings.server_address.trim_end_matches('/'));
    let body = format!(
        r#"<p>Hello!</p>
<p>Hey {headline} Your current balance is <strong>{balance}</strong>.</p>
<p>Please recharge in time to avoid affecting your use.</p>
<p style="text-align: center; margin: 30px 0;">
  <a href="{top_up_link}" style="background-color: #007bff; color: white; padding: 12px 24px; text-decoration: none; border-radius: 4px; display: inline-block;">Top up now!</a>
</p>
<p style="color: #666;">If the button isn't working, copy and paste this link into your browser:</p>
<p style="background-color: #f8f8f8; padding: 10px; border-radius: 4px; word-break: break-all;">{top_up_link}</p>"#
    );
    (
        subject.to_string(),
        email_template(&settings.system_name, subject, &body),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::{wait_until, MemoryStore, RecordingTransport};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
        ledger: QuotaLedger,
    }

    fn fixture(remind_threshold: i64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::without_push());
        let notifier = Notifier::spawn(transport.clone(), store.clone(), None, Duration::from_secs(1));
        let ledger = QuotaLedger::new(
            store.clone(),
            store.clone(),
            store.clone(),
            notifier,
            LedgerSettings {
                remind_threshold,
                server_address: "https://gateway.example.com".to_string(),
                system_name: "Relay Gateway".to_string(),
            },
        );
        Fixture { store, transport, ledger }
    }

    fn token(id: i64, user_id: i64, remain: i64, unlimited: bool) -> Token {
        Token {
            id,
            user_id,
            key: format!("sk-{}", id),
            expired_time: Token::NEVER_EXPIRES,
            remain_quota: remain,
            unlimited_quota: unlimited,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let f = fixture(0);
        assert_eq!(f.ledger.pre_consume(1, -1).await, Err(LedgerError::NegativeQuota));
        assert_eq!(f.ledger.pre_consume(1, 10).await, Err(LedgerError::UnknownToken(1)));
    }

    #[tokio::test]
    async fn insufficient_funds_leave_balances_untouched() {
        let f = fixture(0);
        f.store.insert_account(1, "default", 50);
        f.store.insert_token(token(1, 1, 10, false));
        f.store.insert_token(token(2, 1, 1_000, false));

        assert_eq!(
            f.ledger.pre_consume(1, 20).await,
            Err(LedgerError::InsufficientFunds(FundsScope::Token))
        );
        assert_eq!(
            f.ledger.pre_consume(2, 60).await,
            Err(LedgerError::InsufficientFunds(FundsScope::Account))
        );
        assert_eq!(f.store.account_quota(1), 50);
        assert_eq!(f.store.token(1).remain_quota, 10);
        assert_eq!(f.store.token(2).remain_quota, 1_000);
    }

    #[tokio::test]
    async fn pre_then_post_nets_actual_cost() {
        let f = fixture(0);
        f.store.insert_account(1, "default", 1_000);
        f.store.insert_token(token(1, 1, 500, false));

        f.ledger.pre_consume(1, 100).await.unwrap();
        assert_eq!(f.store.account_quota(1), 900);
        assert_eq!(f.store.token(1).remain_quota, 400);

        // actual 70: settle 70 - 100
        f.ledger.post_consume(1, -30).await.unwrap();
        assert_eq!(f.store.account_quota(1), 930);
        assert_eq!(f.store.token(1).remain_quota, 430);
        assert_eq!(f.store.token(1).used_quota, 70);

        // actual 160: settle 160 - 100
        f.ledger.pre_consume(1, 100).await.unwrap();
        f.ledger.post_consume(1, 60).await.unwrap();
        assert_eq!(f.store.account_quota(1), 770);
        assert_eq!(f.store.token(1).remain_quota, 270);
    }

    #[tokio::test]
    async fn unlimited_token_skips_token_leg() {
        let f = fixture(0);
        f.store.insert_account(1, "default", 1_000);
        f.store.insert_token(token(1, 1, 0, true));

        f.ledger.pre_consume(1, 300).await.unwrap();
        f.ledger.post_consume(1, 50).await.unwrap();
        assert_eq!(f.store.token(1).remain_quota, 0);
        assert_eq!(f.store.token(1).used_quota, 0);
        assert_eq!(f.store.account_quota(1), 650);
    }

    #[tokio::test]
    async fn account_rejection_refunds_token_leg() {
        let f = fixture(0);
        f.store.insert_account(1, "default", 100);
        f.store.insert_token(token(1, 1, 500, false));
        // another request drains the account between the check and the charge
        f.store.drain_account_before_next_charge(1, 90);

        assert_eq!(
            f.ledger.pre_consume(1, 50).await,
            Err(LedgerError::InsufficientFunds(FundsScope::Account))
        );
        assert_eq!(f.store.token(1).remain_quota, 500);
        assert_eq!(f.store.account_quota(1), 10);
    }

    #[tokio::test]
    async fn concurrent_pre_consumes_admit_exactly_what_fits() {
        let f = fixture(0);
        f.store.insert_account(1, "default", 1_000);
        f.store.insert_token(token(1, 1, 350, false));
        let ledger = Arc::new(f.ledger);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.pre_consume(1, 100).await })
            })
            .collect();
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(f.store.token(1).remain_quota, 50);
        assert_eq!(f.store.account_quota(1), 700);
    }

    #[tokio::test]
    async fn post_consume_attempts_every_leg() {
        let f = fixture(0);
        f.store.insert_account(1, "default", 1_000);
        f.store.insert_token(token(1, 1, 500, false));
        f.store.fail_account_writes(true);

        assert_eq!(f.ledger.post_consume(1, 40).await, Err(LedgerError::PersistenceFailed));
        assert_eq!(f.store.token(1).remain_quota, 460);
        assert_eq!(f.store.account_quota(1), 1_000);
    }

    #[tokio::test]
    async fn crossing_the_threshold_mails_the_owner_once() {
        let f = fixture(500);
        f.store.insert_account(1, "default", 600);
        f.store.set_account_email(1, "owner@example.com");
        f.store.insert_token(token(1, 1, 10_000, false));

        f.ledger.pre_consume(1, 50).await.unwrap();
        f.ledger.pre_consume(1, 100).await.unwrap();
        f.ledger.pre_consume(1, 10).await.unwrap();
        wait_until(|| f.transport.emails().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let emails = f.transport.emails();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].0, "owner@example.com");
        assert_eq!(emails[0].1, "Credit Reminder");
    }

    #[tokio::test]
    async fn batched_mode_defers_writes_and_checks_pending() {
        let f = fixture(0);
        f.store.insert_account(1, "default", 150);
        f.store.insert_token(token(1, 1, 1_000, false));
        let batch = Arc::new(BatchUpdater::new());
        let ledger = f.ledger.with_batch(batch.clone());

        ledger.pre_consume(1, 100).await.unwrap();
        assert_eq!(f.store.account_quota(1), 150);
        assert_eq!(
            ledger.pre_consume(1, 100).await,
            Err(LedgerError::InsufficientFunds(FundsScope::Account))
        );
        // the failed attempt releases its token reservation
        assert_eq!(batch.pending_delta(BatchUpdateType::TokenQuota, 1), -100);

        ledger.post_consume(1, 20).await.unwrap();
        ledger.record_usage(1, 3, 120).await.unwrap();
        f.store.insert_channel(3, "c", &["default"], &["gpt-4o"], 1);

        let applied = batch.flush(f.store.as_ref(), f.store.as_ref(), f.store.as_ref()).await;
        assert_eq!(applied, 5);
        assert_eq!(f.store.account_quota(1), 30);
        assert_eq!(f.store.token(1).remain_quota, 880);
        assert_eq!(f.store.account_usage(1), (120, 1));
        assert_eq!(f.store.channel_used_quota(3), 120);
    }

    #[test]
    fn crossing_rules() {
        assert_eq!(low_balance_crossing(1_000, 900, 950), Some(LowBalance::RunningLow));
        assert_eq!(low_balance_crossing(900, 800, 950), None);
        assert_eq!(low_balance_crossing(100, 0, 50), Some(LowBalance::UsedUp));
        assert_eq!(low_balance_crossing(0, 0, 50), None);
    }
}
