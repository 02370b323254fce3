use crate::error::AppError;
use crate::market::now_unix_ms;
use crate::market::scheduler::{schedule, RepeatingTask};
use crate::market::types::{
    known_token, validate_account_id, AccountBalances, BalanceSnapshot, BalanceState,
    LedgerAmount, TokenHolding, DEFAULT_INCLUDE_TOKENS, DEFAULT_REQUEST_TIMEOUT_MS,
    MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS, NATIVE_ASSET_ID, NATIVE_SYMBOL,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Read access to account balances on a ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn native_balance(&self, account_id: &str) -> Result<LedgerAmount, AppError>;
    async fn token_balances(&self, account_id: &str) -> Result<Vec<TokenHolding>, AppError>;
}

#[async_trait]
impl<T: Ledger + ?Sized> Ledger for Arc<T> {
    async fn native_balance(&self, account_id: &str) -> Result<LedgerAmount, AppError> {
        (**self).native_balance(account_id).await
    }

    async fn token_balances(&self, account_id: &str) -> Result<Vec<TokenHolding>, AppError> {
        (**self).token_balances(account_id).await
    }
}

pub struct FetcherOptions {
    pub request_timeout: Duration,
    pub include_tokens: bool,
    pub error_tx: Option<UnboundedSender<AppError>>,
}

impl FetcherOptions {
    pub fn with_error_channel(mut self, error_tx: UnboundedSender<AppError>) -> Self {
        self.error_tx = Some(error_tx);
        self
    }

    pub fn with_tokens(mut self, include_tokens: bool) -> Self {
        self.include_tokens = include_tokens;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            include_tokens: DEFAULT_INCLUDE_TOKENS,
            error_tx: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FetcherState {
    active_account: Option<String>,
    epoch: u64,
    balances: BalanceState,
    polling: bool,
}

/// Account and connection epoch captured when a fetch is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub account_id: String,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchApplyOutcome {
    Applied,
    StaleAccount,
}

impl FetcherState {
    /// Makes `account_id` the active account. Returns `true` when balances of
    /// a different account were cleared.
    fn activate(&mut self, account_id: &str) -> bool {
        if self.active_account.as_deref() == Some(account_id) {
            return false;
        }
        self.active_account = Some(account_id.to_string());
        self.epoch = self.epoch.saturating_add(1);
        !std::mem::take(&mut self.balances).is_empty()
    }

    fn ticket(&self) -> Option<FetchTicket> {
        self.active_account.as_ref().map(|account_id| FetchTicket {
            account_id: account_id.clone(),
            epoch: self.epoch,
        })
    }
}

pub fn apply_fetch_result(
    state: &mut FetcherState,
    ticket: &FetchTicket,
    balances: AccountBalances,
) -> FetchApplyOutcome {
    if state.epoch != ticket.epoch
        || state.active_account.as_deref() != Some(ticket.account_id.as_str())
    {
        return FetchApplyOutcome::StaleAccount;
    }
    state.balances = BalanceState::Loaded(balances);
    FetchApplyOutcome::Applied
}

fn build_account_balances(
    account_id: &str,
    native: LedgerAmount,
    tokens: Vec<TokenHolding>,
    fetched_at: i64,
) -> AccountBalances {
    let native = BalanceSnapshot::from_ledger(
        account_id,
        NATIVE_ASSET_ID,
        Some(NATIVE_SYMBOL.to_string()),
        native,
        fetched_at,
    );
    let mut tokens: Vec<BalanceSnapshot> = tokens
        .into_iter()
        .filter(|holding| holding.amount.raw > 0)
        .map(|holding| {
            let symbol = known_token(&holding.mint).map(|token| token.symbol.to_string());
            BalanceSnapshot::from_ledger(account_id, &holding.mint, symbol, holding.amount, fetched_at)
        })
        .collect();
    tokens.sort_by(|left, right| left.asset_id.cmp(&right.asset_id));

    AccountBalances {
        account_id: account_id.to_string(),
        native,
        tokens,
    }
}

pub type BalanceCallback = Arc<dyn Fn(&BalanceState) + Send + Sync>;

struct FetcherShared<L> {
    ledger: L,
    state: Mutex<FetcherState>,
    request_timeout: Duration,
    include_tokens: bool,
    error_tx: Option<UnboundedSender<AppError>>,
    subscribers: Mutex<Vec<BalanceCallback>>,
    /// Held from a state change until its subscribers have run. Taken before
    /// `state`, so deliveries land in the order the changes were made.
    publish: Mutex<()>,
}

impl<L: Ledger> FetcherShared<L> {
    fn notify(&self, balances: &BalanceState) {
        let callbacks: Vec<BalanceCallback> = self.subscribers.lock().iter().cloned().collect();
        for callback in callbacks {
            callback(balances);
        }
    }

    async fn load(&self, account_id: &str) -> Result<AccountBalances, AppError> {
        let native = self.ledger.native_balance(account_id);
        let (native, tokens) = if self.include_tokens {
            tokio::try_join!(native, self.ledger.token_balances(account_id))?
        } else {
            (native.await?, Vec::new())
        };
        Ok(build_account_balances(account_id, native, tokens, now_unix_ms()))
    }

    async fn run_fetch(&self, ticket: FetchTicket) -> Result<AccountBalances, AppError> {
        let balances =
            match tokio::time::timeout(self.request_timeout, self.load(&ticket.account_id)).await {
                Ok(result) => result?,
                Err(elapsed) => return Err(elapsed.into()),
            };

        let _publish = self.publish.lock();
        let published = {
            let mut state = self.state.lock();
            match apply_fetch_result(&mut state, &ticket, balances.clone()) {
                FetchApplyOutcome::Applied => state.balances.clone(),
                FetchApplyOutcome::StaleAccount => {
                    return Err(AppError::StaleAccount(ticket.account_id));
                }
            }
        };

        debug!(
            account = %ticket.account_id,
            tokens = balances.tokens.len(),
            "balances applied"
        );
        self.notify(&published);
        Ok(balances)
    }

    fn report_cycle_error(&self, error: AppError) {
        if let AppError::StaleAccount(account_id) = &error {
            debug!(account = %account_id, "dropped balances for inactive account");
            return;
        }
        warn!("balance cycle failed: {error}");
        if let Some(error_tx) = &self.error_tx {
            let _ = error_tx.send(error);
        }
    }
}

pub struct BalanceFetcher<L> {
    shared: Arc<FetcherShared<L>>,
    task: Mutex<Option<RepeatingTask>>,
}

impl<L: Ledger + 'static> BalanceFetcher<L> {
    pub fn new(ledger: L, options: FetcherOptions) -> Self {
        Self {
            shared: Arc::new(FetcherShared {
                ledger,
                state: Mutex::new(FetcherState::default()),
                request_timeout: options.request_timeout,
                include_tokens: options.include_tokens,
                error_tx: options.error_tx,
                subscribers: Mutex::new(Vec::new()),
                publish: Mutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    fn activate(&self, account_id: &str) -> FetchTicket {
        let _publish = self.shared.publish.lock();
        let (cleared, ticket) = {
            let mut state = self.shared.state.lock();
            let cleared = state.activate(account_id);
            let ticket = FetchTicket {
                account_id: account_id.to_string(),
                epoch: state.epoch,
            };
            (cleared, ticket)
        };
        if cleared {
            self.shared.notify(&BalanceState::Empty);
        }
        ticket
    }

    /// One-shot fetch that also makes `account_id` the active account. The
    /// account switch happens when this is called.
    pub fn fetch(
        &self,
        account_id: &str,
    ) -> impl Future<Output = Result<AccountBalances, AppError>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let ticket = validate_account_id(account_id).map(|account_id| self.activate(&account_id));

        async move { shared.run_fetch(ticket?).await }
    }

    pub fn start_polling(&self, account_id: &str, interval_ms: u64) -> Result<(), AppError> {
        let account_id = validate_account_id(account_id)?;
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&interval_ms) {
            return Err(AppError::Config(format!(
                "balance poll interval must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS} ms"
            )));
        }

        self.activate(&account_id);
        self.shared.state.lock().polling = true;

        let shared = Arc::clone(&self.shared);
        let task = schedule(Duration::from_millis(interval_ms), move || {
            let ticket = {
                let state = shared.state.lock();
                if state.polling {
                    state.ticket()
                } else {
                    None
                }
            };
            let cycle_shared = Arc::clone(&shared);
            async move {
                if let Some(ticket) = ticket {
                    if let Err(error) = cycle_shared.run_fetch(ticket).await {
                        cycle_shared.report_cycle_error(error);
                    }
                }
            }
        });

        let previous = self.task.lock().replace(task);
        if let Some(previous) = previous {
            previous.cancel();
        }

        info!(account = %account_id, interval_ms, "balance polling started");
        Ok(())
    }

    pub fn stop_polling(&self) {
        let was_polling = std::mem::replace(&mut self.shared.state.lock().polling, false);
        if let Some(task) = self.task.lock().take() {
            task.cancel();
        }
        if was_polling {
            info!("balance polling stopped");
        }
    }

    /// Stops polling and forgets the active account. Balances become
    /// `Empty` before this returns and any fetch still in flight is dropped
    /// when it lands.
    pub fn disconnect(&self) {
        self.stop_polling();
        let _publish = self.shared.publish.lock();
        let previous = {
            let mut state = self.shared.state.lock();
            state.epoch = state.epoch.saturating_add(1);
            state.balances = BalanceState::Empty;
            state.active_account.take()
        };
        self.shared.notify(&BalanceState::Empty);

        if let Some(account_id) = previous {
            info!(account = %account_id, "account disconnected");
        }
    }

    pub fn balances(&self) -> BalanceState {
        self.shared.state.lock().balances.clone()
    }

    pub fn active_account(&self) -> Option<String> {
        self.shared.state.lock().active_account.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.state.lock().polling
    }

    /// Callbacks run on the task that changed the balances and must not
    /// call back into this fetcher's controls.
    pub fn subscribe<C>(&self, callback: C)
    where
        C: Fn(&BalanceState) + Send + Sync + 'static,
    {
        self.shared.subscribers.lock().push(Arc::new(callback));
    }
}

impl<L> Drop for BalanceFetcher<L> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.epoch = state.epoch.saturating_add(1);
        state.polling = false;
    }
}
