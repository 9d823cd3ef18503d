// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use csv::{ReaderBuilder, Trim, Writer};
use payout_ledger::{
    Actor, Amount, BankRecord, Beneficiary, Direction, Engine, EngineConfig, LedgerRecord,
    LedgerStore, Merchant, MerchantId, OrderId, PaymentStatus, Payout, PayoutId, PayoutRequest,
    PayoutStatus, Projection, ReconReport, SchemeConfig, Transaction, TransactionEvent,
    compute_commission, config::MAX_GRACE_HOURS, error::Result as LedgerResult,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

/// Payout Ledger - Replay balances and reconcile settlements from CSV files
///
/// Results go to stdout as CSV. Logs go to stderr and are filtered with
/// `RUST_LOG`.
#[derive(Parser, Debug)]
#[command(name = "payout-ledger")]
#[command(about = "Merchant wallet projection and bank reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Project every merchant's wallet balance from exported records
    Balances {
        /// Payins: order_id,merchant,gross,status,gateway_ref,commission,net,settled_at
        #[arg(long, value_name = "FILE")]
        transactions: PathBuf,
        /// Payouts: payout_id,merchant,amount,status,vpa,requested_at
        #[arg(long, value_name = "FILE")]
        payouts: Option<PathBuf>,
    },
    /// Match ledger settlements against a bank statement
    Reconcile {
        /// Ledger settlements: key,order_id,amount,settled_at
        #[arg(long, value_name = "FILE")]
        ledger: PathBuf,
        /// Bank statement: gateway_ref,amount,bank_date
        #[arg(long, value_name = "FILE")]
        bank: PathBuf,
        /// Largest routine mismatch in minor units (overrides LEDGER_RECON_TOLERANCE)
        #[arg(long)]
        tolerance: Option<Amount>,
        /// Hours a one-sided record may wait (overrides LEDGER_RECON_GRACE_HOURS)
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=MAX_GRACE_HOURS))]
        grace_hours: Option<i64>,
        /// Evaluation time, RFC 3339 (defaults to now)
        #[arg(long)]
        run_at: Option<DateTime<Utc>>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();

    match cli.command {
        Command::Balances {
            transactions,
            payouts,
        } => {
            let engine = Engine::with_config(config);
            if let Err(e) = import_transactions(&engine, open(&transactions)) {
                eprintln!("Error reading transactions: {}", e);
                process::exit(1);
            }
            if let Some(path) = payouts {
                if let Err(e) = import_payouts(&engine, open(&path)) {
                    eprintln!("Error reading payouts: {}", e);
                    process::exit(1);
                }
            }
            let projections = match engine.backfill_all() {
                Ok(projections) => projections,
                Err(e) => {
                    eprintln!("Error projecting balances: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = write_balances(&projections, std::io::stdout()) {
                eprintln!("Error writing output: {}", e);
                process::exit(1);
            }
        }
        Command::Reconcile {
            ledger,
            bank,
            tolerance,
            grace_hours,
            run_at,
        } => {
            if let Some(tolerance) = tolerance {
                config.recon.tolerance = tolerance;
            }
            if let Some(grace_hours) = grace_hours {
                config.recon.grace_hours = grace_hours;
            }
            let ledger = read_ledger(open(&ledger)).unwrap_or_else(|e| {
                eprintln!("Error reading ledger: {}", e);
                process::exit(1);
            });
            let bank = read_bank(open(&bank)).unwrap_or_else(|e| {
                eprintln!("Error reading bank statement: {}", e);
                process::exit(1);
            });
            let report =
                payout_ledger::reconcile(&ledger, &bank, &config.recon, run_at.unwrap_or_else(Utc::now));
            eprintln!(
                "matched: {}, exceptions: {}, awaiting: {}",
                report.matched.len(),
                report.exceptions.len(),
                report.awaiting.len()
            );
            if let Err(e) = write_exceptions(&report, std::io::stdout()) {
                eprintln!("Error writing output: {}", e);
                process::exit(1);
            }
        }
    }
}

fn open(path: &Path) -> BufReader<File> {
    match File::open(path) {
        Ok(f) => BufReader::new(f),
        Err(e) => {
            eprintln!("Error opening file '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader)
}

/// Payin row of a transaction export.
#[derive(Debug, Deserialize)]
struct TransactionRow {
    order_id: String,
    merchant: u32,
    gross: Amount,
    status: PaymentStatus,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    gateway_ref: Option<String>,
    /// Commission fixed at settlement.
    #[serde(default, deserialize_with = "csv::invalid_option")]
    commission: Option<Amount>,
    /// Stored net amount, when the export carries one.
    #[serde(default, deserialize_with = "csv::invalid_option")]
    net: Option<Amount>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    settled_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    /// Rebuilds the stored transaction. Rows with a settlement time are
    /// settled with their exported commission.
    fn into_transaction(self) -> LedgerResult<Transaction> {
        let event = TransactionEvent {
            order_id: OrderId::new(self.order_id),
            merchant_id: MerchantId(self.merchant),
            gross_amount: self.gross,
            status: self.status,
            gateway: "import".to_string(),
            gateway_ref: self.gateway_ref.filter(|r| !r.is_empty()),
        };
        let created_at = self.settled_at.unwrap_or_else(Utc::now);
        let mut transaction = Transaction::from_event(event, created_at)?;
        if let (Some(settled_at), PaymentStatus::Paid) = (self.settled_at, transaction.status) {
            let scheme = SchemeConfig::flat(self.commission.unwrap_or(0))?;
            transaction.settle(&scheme, settled_at)?;
            if self.net.is_some() {
                transaction.net_amount = self.net;
            }
        }
        Ok(transaction)
    }
}

/// Payout row of a payout export.
#[derive(Debug, Deserialize)]
struct PayoutRow {
    payout_id: u64,
    merchant: u32,
    amount: Amount,
    status: PayoutStatus,
    vpa: String,
    requested_at: DateTime<Utc>,
}

const IMPORTED: &str = "imported";

impl PayoutRow {
    /// Rebuilds the payout and walks it to its exported status.
    fn into_payout(self) -> LedgerResult<Payout> {
        let request = PayoutRequest {
            merchant_id: MerchantId(self.merchant),
            amount: self.amount,
            currency: "INR".to_string(),
            beneficiary: Beneficiary::Upi { vpa: self.vpa },
        };
        let at = self.requested_at;
        let actor = Actor::system();
        let mut payout = Payout::new(PayoutId(self.payout_id), request, actor.clone(), at)?;

        match self.status {
            PayoutStatus::Requested => {}
            PayoutStatus::Pending => payout.hold(actor, at, None)?,
            PayoutStatus::Approved => payout.approve(actor, at)?,
            PayoutStatus::Rejected => payout.reject(IMPORTED, actor, at)?,
            PayoutStatus::Cancelled => payout.cancel(IMPORTED, actor, at)?,
            status @ (PayoutStatus::Processing | PayoutStatus::Completed | PayoutStatus::Failed) => {
                payout.approve(actor.clone(), at)?;
                let commission =
                    compute_commission(payout.amount, &SchemeConfig::free(), Direction::Payout)?;
                payout.start_processing(commission, actor.clone(), at)?;
                match status {
                    PayoutStatus::Completed => payout.complete(IMPORTED, actor, at)?,
                    PayoutStatus::Failed => payout.fail(IMPORTED, actor, at)?,
                    _ => {}
                }
            }
        }
        Ok(payout)
    }
}

/// Registers merchants on first sight with default commission schemes.
fn ensure_merchant(engine: &Engine, merchant_id: MerchantId) {
    if engine.merchant(merchant_id).is_err() {
        let merchant = Merchant::new(merchant_id, merchant_id.to_string(), Default::default());
        if let Err(e) = engine.register_merchant(merchant) {
            tracing::debug!(merchant = %merchant_id, error = %e, "merchant not registered");
        }
    }
}

/// Loads exported payins into the engine's store.
///
/// Malformed rows and rows that fail validation are skipped with a debug
/// log. Returns the number of imported transactions.
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn import_transactions<R: Read>(engine: &Engine, reader: R) -> Result<usize, csv::Error> {
    let mut imported = 0;
    for result in csv_reader(reader).deserialize::<TransactionRow>() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed transaction row");
                continue;
            }
        };
        let merchant_id = MerchantId(row.merchant);
        let stored = row
            .into_transaction()
            .and_then(|tx| engine.store().insert_transaction(tx));
        match stored {
            Ok(()) => {
                ensure_merchant(engine, merchant_id);
                imported += 1;
            }
            Err(e) => tracing::debug!(error = %e, "skipping transaction row"),
        }
    }
    Ok(imported)
}

/// Loads exported payouts into the engine's store.
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn import_payouts<R: Read>(engine: &Engine, reader: R) -> Result<usize, csv::Error> {
    let mut imported = 0;
    for result in csv_reader(reader).deserialize::<PayoutRow>() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed payout row");
                continue;
            }
        };
        let merchant_id = MerchantId(row.merchant);
        let stored = row
            .into_payout()
            .and_then(|payout| engine.store().insert_payout(payout));
        match stored {
            Ok(()) => {
                ensure_merchant(engine, merchant_id);
                imported += 1;
            }
            Err(e) => tracing::debug!(error = %e, "skipping payout row"),
        }
    }
    Ok(imported)
}

#[derive(Debug, Serialize)]
struct BalanceRow {
    merchant: u32,
    credits: Amount,
    debits: Amount,
    balance: Amount,
    warnings: usize,
}

/// Writes one row per merchant.
///
/// # CSV Format
///
/// Columns: `merchant, credits, debits, balance, warnings`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_balances<W: Write>(projections: &[Projection], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for projection in projections {
        wtr.serialize(BalanceRow {
            merchant: projection.merchant_id.0,
            credits: projection.credits,
            debits: projection.debits,
            balance: projection.balance,
            warnings: projection.warnings.len(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LedgerRow {
    key: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    order_id: Option<String>,
    amount: Amount,
    settled_at: DateTime<Utc>,
}

/// Reads ledger settlements, skipping malformed rows.
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn read_ledger<R: Read>(reader: R) -> Result<Vec<LedgerRecord>, csv::Error> {
    let mut records = Vec::new();
    for result in csv_reader(reader).deserialize::<LedgerRow>() {
        match result {
            Ok(row) => records.push(LedgerRecord {
                key: row.key,
                order_id: row.order_id.filter(|id| !id.is_empty()).map(OrderId::new),
                amount: row.amount,
                settled_at: row.settled_at,
                in_flux: false,
            }),
            Err(e) => tracing::debug!(error = %e, "skipping malformed ledger row"),
        }
    }
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct BankRow {
    gateway_ref: String,
    amount: Amount,
    bank_date: NaiveDate,
}

/// Reads bank statement lines, skipping malformed rows.
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn read_bank<R: Read>(reader: R) -> Result<Vec<BankRecord>, csv::Error> {
    let mut records = Vec::new();
    for result in csv_reader(reader).deserialize::<BankRow>() {
        match result {
            Ok(row) => records.push(BankRecord {
                gateway_ref: row.gateway_ref,
                amount: row.amount,
                bank_date: row.bank_date,
            }),
            Err(e) => tracing::debug!(error = %e, "skipping malformed bank row"),
        }
    }
    Ok(records)
}

#[derive(Debug, Serialize)]
struct ExceptionRow<'a> {
    id: String,
    kind: String,
    status: String,
    reference: &'a str,
    expected: Option<Amount>,
    actual: Option<Amount>,
    delta: Amount,
}

/// Writes the run's exceptions.
///
/// # CSV Format
///
/// Columns: `id, kind, status, reference, expected, actual, delta`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_exceptions<W: Write>(report: &ReconReport, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for exception in &report.exceptions {
        wtr.serialize(ExceptionRow {
            id: exception.id.to_string(),
            kind: exception.kind.to_string(),
            status: exception.status.to_string(),
            reference: &exception.reference,
            expected: exception.expected,
            actual: exception.actual,
            delta: exception.delta,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use payout_ledger::{ExceptionKind, ReconConfig};
    use std::io::Cursor;

    const TRANSACTIONS: &str = "order_id,merchant,gross,status,gateway_ref,commission,net,settled_at\n\
        ORD-1,1,100000,paid,GW-1,4484,,2025-06-01T08:00:00Z\n\
        ORD-2,1,5000,pending,,,,\n\
        ORD-3,2,20000,paid,GW-3,300,19800,2025-06-01T09:00:00Z\n";

    fn imported_engine() -> Engine {
        let engine = Engine::new();
        import_transactions(&engine, Cursor::new(TRANSACTIONS)).unwrap();
        engine
    }

    #[test]
    fn import_settles_paid_rows() {
        let engine = imported_engine();
        let tx = engine.transaction(&OrderId::new("ORD-1")).unwrap();
        assert!(tx.is_settled());
        assert_eq!(tx.net_amount, Some(95_516));
        assert!(!engine.transaction(&OrderId::new("ORD-2")).unwrap().is_settled());
    }

    #[test]
    fn balances_subtract_reserved_payouts() {
        let engine = imported_engine();
        let payouts = "payout_id,merchant,amount,status,vpa,requested_at\n\
            1,1,50000,requested,acme@upi,2025-06-02T08:00:00Z\n\
            2,1,10000,failed,acme@upi,2025-06-02T09:00:00Z\n\
            3,1,1000,completed,acme@upi,2025-06-02T10:00:00Z\n";
        assert_eq!(import_payouts(&engine, Cursor::new(payouts)).unwrap(), 3);

        let projections = engine.backfill_all().unwrap();
        assert_eq!(projections[0].balance, 95_516 - 50_000 - 1_000);
        assert_eq!(engine.merchant(MerchantId(1)).unwrap().wallet_balance, 44_516);
    }

    #[test]
    fn stored_net_mismatch_is_reported() {
        let engine = imported_engine();
        let projections = engine.backfill_all().unwrap();
        let merchant_two = &projections[1];
        assert_eq!(merchant_two.balance, 19_800);
        assert_eq!(merchant_two.warnings.len(), 1);

        let mut output = Vec::new();
        write_balances(&projections, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("merchant,credits,debits,balance,warnings\n"));
        assert!(output.contains("2,19800,0,19800,1"));
    }

    #[test]
    fn skip_malformed_rows() {
        let csv = "order_id,merchant,gross,status,gateway_ref,commission,net,settled_at\n\
                   ORD-1,1,100,paid,,,,2025-06-01T08:00:00Z\n\
                   ORD-2,abc,100,paid,,,,\n\
                   ORD-3,1,-5,paid,,,,\n\
                   ORD-4,1,100,refunded,,,,\n\
                   ORD-5,2,50,paid,,,,2025-06-01T08:00:00Z\n";
        let engine = Engine::new();
        assert_eq!(import_transactions(&engine, Cursor::new(csv)).unwrap(), 2);
        assert_eq!(engine.balance(MerchantId(1)).unwrap(), 100);
        assert_eq!(engine.balance(MerchantId(2)).unwrap(), 50);
    }

    #[test]
    fn parse_with_whitespace() {
        let csv = "key,order_id,amount,settled_at\n GW-1 , ORD-1 , 75000 , 2025-05-08T09:00:00Z \n";
        let records = read_ledger(Cursor::new(csv)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "GW-1");
        assert_eq!(records[0].order_id, Some(OrderId::new("ORD-1")));
    }

    #[test]
    fn reconcile_from_csv() {
        let ledger = "key,order_id,amount,settled_at\n\
                      GW-1,ORD-1,75000,2025-05-08T09:00:00Z\n\
                      GW-2,ORD-2,10000,2025-05-08T09:00:00Z\n";
        let bank = "gateway_ref,amount,bank_date\n\
                    GW-1,74550,2025-05-08\n\
                    GW-2,10000,2025-05-08\n\
                    GW-9,oops,2025-05-08\n";
        let ledger = read_ledger(Cursor::new(ledger)).unwrap();
        let bank = read_bank(Cursor::new(bank)).unwrap();
        assert_eq!(bank.len(), 2);

        let run_at = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();
        let report = payout_ledger::reconcile(&ledger, &bank, &ReconConfig::default(), run_at);
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.count(ExceptionKind::AmountMismatch), 1);

        let mut output = Vec::new();
        write_exceptions(&report, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("AMOUNT_MISMATCH,pending,GW-1,75000,74550,450"));
    }

    #[test]
    fn grace_hours_flag_is_range_checked() {
        let base = ["payout-ledger", "reconcile", "--ledger", "l.csv", "--bank", "b.csv"];
        let parse = |hours: &str| {
            Cli::try_parse_from(base.iter().copied().chain(["--grace-hours", hours]))
        };

        assert!(parse("24").is_ok());
        assert!(parse("-1").is_err());
        assert!(parse("9223372036854775").is_err());
    }
}
