use crate::error::AppError;
use crate::market::balance::Ledger;
use crate::market::coingecko::build_http_client;
use crate::market::types::{LedgerAmount, TokenHolding, NATIVE_DECIMALS};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const SOLANA_MAINNET_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
pub const SPL_TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

const RPC_COMMITMENT: &str = "confirmed";
const RPC_INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

impl<'a, P> RpcRequest<'a, P> {
    fn new(method: &'a str, params: P) -> Self {
        Self {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
struct CommitmentConfig {
    commitment: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgramFilter<'a> {
    program_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ParsedAccountsConfig {
    encoding: &'static str,
    commitment: &'static str,
}

#[derive(Debug, Deserialize)]
struct RpcErrorWire {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponseWire<T> {
    result: Option<T>,
    error: Option<RpcErrorWire>,
}

#[derive(Debug, Deserialize)]
struct ContextValueWire<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct KeyedTokenAccountWire {
    account: TokenAccountWire,
}

#[derive(Debug, Deserialize)]
struct TokenAccountWire {
    data: TokenAccountDataWire,
}

#[derive(Debug, Deserialize)]
struct TokenAccountDataWire {
    parsed: ParsedTokenAccountWire,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenAccountWire {
    info: TokenAccountInfoWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenAccountInfoWire {
    mint: String,
    token_amount: TokenAmountWire,
}

#[derive(Debug, Deserialize)]
struct TokenAmountWire {
    amount: String,
    decimals: u8,
}

impl TryFrom<TokenAccountInfoWire> for TokenHolding {
    type Error = AppError;

    fn try_from(value: TokenAccountInfoWire) -> Result<Self, Self::Error> {
        let raw = value.token_amount.amount.parse::<u64>()?;
        Ok(Self {
            mint: value.mint,
            amount: LedgerAmount {
                raw,
                decimals: value.token_amount.decimals,
            },
        })
    }
}

fn unwrap_rpc_result<T>(response: RpcResponseWire<T>) -> Result<T, AppError> {
    if let Some(error) = response.error {
        let message = format!("rpc error {}: {}", error.code, error.message);
        return Err(if error.code == RPC_INVALID_PARAMS {
            AppError::InvalidAccount(message)
        } else {
            AppError::Network(message)
        });
    }
    response
        .result
        .ok_or_else(|| AppError::Schema("rpc response without result".to_string()))
}

fn parse_balance_response(payload: &mut [u8]) -> Result<LedgerAmount, AppError> {
    let wire: RpcResponseWire<ContextValueWire<u64>> = simd_json::serde::from_slice(payload)?;
    let lamports = unwrap_rpc_result(wire)?.value;
    Ok(LedgerAmount {
        raw: lamports,
        decimals: NATIVE_DECIMALS,
    })
}

fn parse_token_accounts_response(payload: &mut [u8]) -> Result<Vec<TokenHolding>, AppError> {
    let wire: RpcResponseWire<ContextValueWire<Vec<KeyedTokenAccountWire>>> =
        simd_json::serde::from_slice(payload)?;
    unwrap_rpc_result(wire)?
        .value
        .into_iter()
        .map(|keyed| TokenHolding::try_from(keyed.account.data.parsed.info))
        .collect()
}

/// Sums holdings that share a mint and drops empty ones.
fn merge_holdings(holdings: impl IntoIterator<Item = TokenHolding>) -> Vec<TokenHolding> {
    let mut by_mint: BTreeMap<String, LedgerAmount> = BTreeMap::new();
    for holding in holdings {
        by_mint
            .entry(holding.mint)
            .and_modify(|amount| amount.raw = amount.raw.saturating_add(holding.amount.raw))
            .or_insert(holding.amount);
    }
    by_mint
        .into_iter()
        .filter(|(_, amount)| amount.raw > 0)
        .map(|(mint, amount)| TokenHolding { mint, amount })
        .collect()
}

/// Solana JSON-RPC ledger client.
#[derive(Debug, Clone)]
pub struct SolanaLedger {
    client: Client,
    rpc_url: String,
}

impl SolanaLedger {
    pub fn new(rpc_url: impl Into<String>, request_timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
            rpc_url: rpc_url.into(),
        })
    }

    async fn call<P: Serialize>(&self, request: &RpcRequest<'_, P>) -> Result<Vec<u8>, AppError> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn program_token_accounts(
        &self,
        account_id: &str,
        program_id: &str,
    ) -> Result<Vec<TokenHolding>, AppError> {
        let request = RpcRequest::new(
            "getTokenAccountsByOwner",
            (
                account_id,
                ProgramFilter { program_id },
                ParsedAccountsConfig {
                    encoding: "jsonParsed",
                    commitment: RPC_COMMITMENT,
                },
            ),
        );
        let mut payload = self.call(&request).await?;
        parse_token_accounts_response(&mut payload)
    }
}

#[async_trait]
impl Ledger for SolanaLedger {
    async fn native_balance(&self, account_id: &str) -> Result<LedgerAmount, AppError> {
        let request = RpcRequest::new(
            "getBalance",
            (
                account_id,
                CommitmentConfig {
                    commitment: RPC_COMMITMENT,
                },
            ),
        );
        let mut payload = self.call(&request).await?;
        parse_balance_response(&mut payload)
    }

    async fn token_balances(&self, account_id: &str) -> Result<Vec<TokenHolding>, AppError> {
        let per_program = try_join_all(
            [SPL_TOKEN_PROGRAM_ID, TOKEN_2022_PROGRAM_ID]
                .into_iter()
                .map(|program_id| self.program_token_accounts(account_id, program_id)),
        )
        .await?;
        Ok(merge_holdings(per_program.into_iter().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1";

    #[test]
    fn serializes_get_balance_request() {
        let request = RpcRequest::new(
            "getBalance",
            (
                OWNER,
                CommitmentConfig {
                    commitment: RPC_COMMITMENT,
                },
            ),
        );
        let rendered = simd_json::serde::to_string(&request).expect("request should serialize");

        assert_eq!(
            rendered,
            format!(
                r#"{{"jsonrpc":"2.0","id":1,"method":"getBalance","params":["{OWNER}",{{"commitment":"confirmed"}}]}}"#
            )
        );
    }

    #[test]
    fn serializes_token_accounts_request() {
        let request = RpcRequest::new(
            "getTokenAccountsByOwner",
            (
                OWNER,
                ProgramFilter {
                    program_id: TOKEN_2022_PROGRAM_ID,
                },
                ParsedAccountsConfig {
                    encoding: "jsonParsed",
                    commitment: RPC_COMMITMENT,
                },
            ),
        );
        let rendered = simd_json::serde::to_string(&request).expect("request should serialize");

        assert!(rendered.contains(r#""programId":"TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb""#));
        assert!(rendered.contains(r#""encoding":"jsonParsed""#));
    }

    #[test]
    fn parses_balance_in_lamports() {
        let mut payload =
            br#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":2500000000},"id":1}"#
                .to_vec();
        let amount = parse_balance_response(&mut payload).expect("balance should parse");

        assert_eq!(amount.raw, 2_500_000_000);
        assert_eq!(amount.ui_amount(), 2.5);
    }

    #[test]
    fn parses_token_accounts() {
        let mut payload = br#"{"jsonrpc":"2.0","id":1,"result":{"context":{"slot":1},"value":[
            {"pubkey":"Acc1","account":{"lamports":2039280,"owner":"TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA","data":{"program":"spl-token","space":165,"parsed":{"type":"account","info":{"isNative":false,"mint":"EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v","owner":"5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1","state":"initialized","tokenAmount":{"amount":"12500000","decimals":6,"uiAmount":12.5,"uiAmountString":"12.5"}}}}}}
        ]}}"#
            .to_vec();
        let holdings = parse_token_accounts_response(&mut payload).expect("accounts should parse");

        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].mint, "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v");
        assert_eq!(holdings[0].amount.ui_amount(), 12.5);
    }

    #[test]
    fn maps_rpc_errors() {
        let mut invalid =
            br#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid param: WrongSize"},"id":1}"#
                .to_vec();
        assert!(matches!(
            parse_balance_response(&mut invalid),
            Err(AppError::InvalidAccount(_))
        ));

        let mut overloaded =
            br#"{"jsonrpc":"2.0","error":{"code":-32005,"message":"Node is behind"},"id":1}"#
                .to_vec();
        assert!(matches!(
            parse_balance_response(&mut overloaded),
            Err(AppError::Network(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_token_amount() {
        let mut payload = br#"{"jsonrpc":"2.0","id":1,"result":{"context":{"slot":1},"value":[
            {"pubkey":"Acc1","account":{"data":{"parsed":{"info":{"mint":"M1","tokenAmount":{"amount":"lots","decimals":6}}}}}}
        ]}}"#
            .to_vec();
        assert!(matches!(
            parse_token_accounts_response(&mut payload),
            Err(AppError::Schema(_))
        ));
    }

    #[test]
    fn merges_holdings_per_mint_and_skips_zero() {
        let amount = |raw| LedgerAmount { raw, decimals: 6 };
        let merged = merge_holdings(vec![
            TokenHolding {
                mint: "B".to_string(),
                amount: amount(5),
            },
            TokenHolding {
                mint: "A".to_string(),
                amount: amount(0),
            },
            TokenHolding {
                mint: "B".to_string(),
                amount: amount(7),
            },
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].mint, "B");
        assert_eq!(merged[0].amount.raw, 12);
    }
}
