use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use casebill::billing::money::{format_hours, format_money};
use casebill::billing::{
    BillingEngine, CreateInvoiceRequest, InvoiceChanges, InvoiceDetails, LogTimeEntryRequest,
    PaymentChanges, RecordPaymentRequest, TimeEntryChanges,
};
use casebill::config::{Config, LogFormat, LoggingConfig};
use casebill::db::{
    ActivityCode, InvoiceFilter, InvoiceStatus, PaymentFilter, PaymentMethod, TimeEntryFilter,
};
use casebill::directory::InMemoryDirectory;

#[derive(Parser, Debug)]
#[command(name = "casebill", version)]
#[command(about = "Time entries, invoices, and payments that always add up")]
struct Cli {
    /// Practice directory (TOML) with clients, cases, and attorneys.
    #[arg(long, global = true, env = "CASEBILL_DIRECTORY")]
    directory: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations and exit.
    Migrate,
    #[command(subcommand)]
    Time(TimeCommand),
    #[command(subcommand)]
    Invoice(InvoiceCommand),
    #[command(subcommand)]
    Payment(PaymentCommand),
    #[command(subcommand)]
    Report(ReportCommand),
}

#[derive(Subcommand, Debug)]
enum TimeCommand {
    /// Log billable work on a case.
    Log {
        #[arg(long)]
        case: String,
        #[arg(long)]
        attorney: String,
        #[arg(long)]
        hours: Decimal,
        #[arg(long)]
        description: String,
        #[arg(long, value_parser = parse_activity, default_value = "OTH")]
        activity: ActivityCode,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        rate: Option<Decimal>,
        #[arg(long)]
        code: Option<String>,
    },
    /// Change an entry. Billed entries only accept description and activity changes.
    Edit {
        entry: String,
        #[arg(long)]
        case: Option<String>,
        #[arg(long)]
        attorney: Option<String>,
        #[arg(long)]
        hours: Option<Decimal>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_parser = parse_activity)]
        activity: Option<ActivityCode>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, conflicts_with = "clear_rate")]
        rate: Option<Decimal>,
        #[arg(long)]
        clear_rate: bool,
    },
    /// Delete an unbilled entry.
    Delete { entry: String },
    List {
        #[arg(long)]
        case: Option<String>,
        #[arg(long, requires = "case")]
        unbilled: bool,
        #[arg(long, conflicts_with = "case")]
        attorney: Option<String>,
        #[command(flatten)]
        range: DateRangeArgs,
    },
}

#[derive(Subcommand, Debug)]
enum InvoiceCommand {
    /// Bill every unbilled entry of a case on a new issued invoice.
    Bill {
        case: String,
        #[arg(long)]
        number: Option<String>,
        #[arg(long)]
        due: Option<NaiveDate>,
    },
    /// Create an invoice, optionally billing specific entries.
    Create {
        case: String,
        #[arg(long)]
        number: Option<String>,
        #[arg(long)]
        issue_date: Option<NaiveDate>,
        #[arg(long)]
        due: Option<NaiveDate>,
        #[arg(long)]
        draft: bool,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long = "entry")]
        entries: Vec<String>,
    },
    /// Change an invoice's dates or notes.
    Edit {
        invoice: String,
        #[arg(long)]
        issue_date: Option<NaiveDate>,
        #[arg(long)]
        due: Option<NaiveDate>,
        #[arg(long, conflicts_with = "clear_notes")]
        notes: Option<String>,
        #[arg(long)]
        clear_notes: bool,
        #[arg(long)]
        expected_version: Option<i64>,
    },
    /// Bill more entries on an existing invoice.
    Attach {
        invoice: String,
        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Return a billed entry to unbilled.
    Detach { entry: String },
    Show {
        invoice: String,
        /// Print a human-readable statement instead of JSON.
        #[arg(long)]
        text: bool,
    },
    List {
        #[arg(long, conflicts_with = "client")]
        case: Option<String>,
        #[arg(long)]
        client: Option<String>,
        #[arg(long, value_parser = parse_status, conflicts_with_all = ["case", "client"])]
        status: Option<InvoiceStatus>,
        #[command(flatten)]
        range: DateRangeArgs,
    },
    /// Invoices past due and still unpaid.
    Overdue,
    /// Re-derive statuses: one invoice, or every open invoice.
    Refresh { invoice: Option<String> },
    Issue { invoice: String },
    Cancel { invoice: String },
    /// Delete an invoice without payments and unbill its entries.
    Delete { invoice: String },
    /// Preview the next invoice number.
    NextNumber,
}

#[derive(Subcommand, Debug)]
enum PaymentCommand {
    Record {
        invoice: String,
        amount: Decimal,
        #[arg(long, value_parser = parse_method, default_value = "other")]
        method: PaymentMethod,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        reference: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Edit {
        payment: String,
        #[arg(long)]
        amount: Option<Decimal>,
        #[arg(long, value_parser = parse_method)]
        method: Option<PaymentMethod>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        reference: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Delete { payment: String },
    List {
        #[arg(long, conflicts_with = "client")]
        invoice: Option<String>,
        #[arg(long)]
        client: Option<String>,
        #[arg(long, value_parser = parse_method, conflicts_with_all = ["invoice", "client"])]
        method: Option<PaymentMethod>,
        #[command(flatten)]
        range: DateRangeArgs,
    },
    /// Cash received from a client, or within a date range.
    Total {
        #[arg(long)]
        client: Option<String>,
        #[command(flatten)]
        range: DateRangeArgs,
    },
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
    /// Billing position of one case.
    Case {
        case: String,
        /// Print a human-readable summary instead of JSON.
        #[arg(long)]
        text: bool,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct DateRangeArgs {
    #[arg(long, requires = "to")]
    from: Option<NaiveDate>,
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
}

impl DateRangeArgs {
    fn bounds(self) -> Option<(NaiveDate, NaiveDate)> {
        self.from.zip(self.to)
    }
}

fn parse_activity(value: &str) -> Result<ActivityCode, String> {
    ActivityCode::from_db_value(value).ok_or_else(|| {
        let known: Vec<&str> = ActivityCode::ALL.iter().map(|c| c.as_str()).collect();
        format!("unknown activity code '{value}' (expected one of {})", known.join(", "))
    })
}

fn parse_method(value: &str) -> Result<PaymentMethod, String> {
    PaymentMethod::parse_loose(value).ok_or_else(|| format!("unknown payment method '{value}'"))
}

fn parse_status(value: &str) -> Result<InvoiceStatus, String> {
    let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    InvoiceStatus::from_db_value(&normalized)
        .ok_or_else(|| format!("unknown invoice status '{value}'"))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(logging.ansi)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct App {
    engine: BillingEngine,
}

impl App {
    /// Accepts a UUID or an `INV` number.
    async fn invoice_id(&self, reference: &str) -> anyhow::Result<Uuid> {
        if let Ok(id) = Uuid::parse_str(reference.trim()) {
            return Ok(id);
        }
        Ok(self.engine.find_invoice_by_number(reference).await?.id)
    }

    /// Accepts a UUID or a `TE` code.
    async fn time_entry_id(&self, reference: &str) -> anyhow::Result<Uuid> {
        if let Ok(id) = Uuid::parse_str(reference.trim()) {
            return Ok(id);
        }
        Ok(self.engine.find_time_entry_by_code(reference).await?.id)
    }

    /// Accepts a UUID or a `PMT` number.
    async fn payment_id(&self, reference: &str) -> anyhow::Result<Uuid> {
        if let Ok(id) = Uuid::parse_str(reference.trim()) {
            return Ok(id);
        }
        Ok(self.engine.find_payment_by_number(reference).await?.id)
    }

    async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Migrate => print_json(&serde_json::json!({ "migrated": true })),
            Command::Time(cmd) => self.run_time(cmd).await,
            Command::Invoice(cmd) => self.run_invoice(cmd).await,
            Command::Payment(cmd) => self.run_payment(cmd).await,
            Command::Report(cmd) => self.run_report(cmd).await,
        }
    }

    async fn run_time(&self, command: TimeCommand) -> anyhow::Result<()> {
        match command {
            TimeCommand::Log {
                case,
                attorney,
                hours,
                description,
                activity,
                date,
                rate,
                code,
            } => {
                let entry = self
                    .engine
                    .log_time_entry(LogTimeEntryRequest {
                        case_id: case,
                        attorney_id: attorney,
                        hours,
                        description,
                        activity_code: activity,
                        entry_date: date,
                        hourly_rate: rate,
                        entry_code: code,
                    })
                    .await?;
                print_json(&entry)
            }
            TimeCommand::Edit {
                entry,
                case,
                attorney,
                hours,
                description,
                activity,
                date,
                rate,
                clear_rate,
            } => {
                let id = self.time_entry_id(&entry).await?;
                let hourly_rate = if clear_rate { Some(None) } else { rate.map(Some) };
                let updated = self
                    .engine
                    .update_time_entry(
                        id,
                        TimeEntryChanges {
                            case_id: case,
                            attorney_id: attorney,
                            entry_date: date,
                            hours,
                            description,
                            activity_code: activity,
                            hourly_rate,
                        },
                    )
                    .await?;
                print_json(&updated)
            }
            TimeCommand::Delete { entry } => {
                let id = self.time_entry_id(&entry).await?;
                self.engine.delete_time_entry(id).await?;
                print_json(&serde_json::json!({ "deleted": id }))
            }
            TimeCommand::List {
                case,
                unbilled,
                attorney,
                range,
            } => {
                let entries = match (case, attorney, range.bounds()) {
                    (Some(case), _, _) if unbilled => {
                        self.engine.find_unbilled_time_entries(&case).await?
                    }
                    (Some(case), _, _) => {
                        self.engine
                            .list_time_entries(TimeEntryFilter::Case(case))
                            .await?
                    }
                    (None, Some(attorney), _) => {
                        self.engine
                            .list_time_entries(TimeEntryFilter::Attorney(attorney))
                            .await?
                    }
                    (None, None, Some((start, end))) => {
                        self.engine
                            .list_time_entries(TimeEntryFilter::DateRange { start, end })
                            .await?
                    }
                    (None, None, None) => {
                        self.engine.list_time_entries(TimeEntryFilter::All).await?
                    }
                };
                print_json(&entries)
            }
        }
    }

    async fn run_invoice(&self, command: InvoiceCommand) -> anyhow::Result<()> {
        match command {
            InvoiceCommand::Bill { case, number, due } => {
                let invoice = self
                    .engine
                    .bill_time_entries(&case, number.as_deref(), due)
                    .await?;
                print_json(&invoice)
            }
            InvoiceCommand::Create {
                case,
                number,
                issue_date,
                due,
                draft,
                notes,
                entries,
            } => {
                let mut time_entry_ids = Vec::with_capacity(entries.len());
                for entry in &entries {
                    time_entry_ids.push(self.time_entry_id(entry).await?);
                }
                let invoice = self
                    .engine
                    .create_invoice(CreateInvoiceRequest {
                        case_id: case,
                        invoice_number: number,
                        issue_date,
                        due_date: due,
                        status: if draft {
                            InvoiceStatus::Draft
                        } else {
                            InvoiceStatus::Issued
                        },
                        notes,
                        time_entry_ids,
                    })
                    .await?;
                print_json(&invoice)
            }
            InvoiceCommand::Edit {
                invoice,
                issue_date,
                due,
                notes,
                clear_notes,
                expected_version,
            } => {
                let id = self.invoice_id(&invoice).await?;
                let notes = if clear_notes { Some(None) } else { notes.map(Some) };
                let updated = self
                    .engine
                    .update_invoice(
                        id,
                        InvoiceChanges {
                            issue_date,
                            due_date: due,
                            notes,
                            expected_version,
                        },
                    )
                    .await?;
                print_json(&updated)
            }
            InvoiceCommand::Attach { invoice, entries } => {
                let id = self.invoice_id(&invoice).await?;
                let mut time_entry_ids = Vec::with_capacity(entries.len());
                for entry in &entries {
                    time_entry_ids.push(self.time_entry_id(entry).await?);
                }
                print_json(&self.engine.attach_time_entries(id, time_entry_ids).await?)
            }
            InvoiceCommand::Detach { entry } => {
                let id = self.time_entry_id(&entry).await?;
                print_json(&self.engine.detach_time_entry(id).await?)
            }
            InvoiceCommand::Show { invoice, text } => {
                let id = self.invoice_id(&invoice).await?;
                let details = self.engine.invoice_details(id).await?;
                if text {
                    self.print_invoice(&details);
                    Ok(())
                } else {
                    print_json(&details)
                }
            }
            InvoiceCommand::List {
                case,
                client,
                status,
                range,
            } => {
                let filter = match (case, client, status, range.bounds()) {
                    (Some(case), _, _, _) => InvoiceFilter::Case(case),
                    (None, Some(client), _, _) => InvoiceFilter::Client(client),
                    (None, None, Some(status), _) => InvoiceFilter::Status(status),
                    (None, None, None, Some((start, end))) => {
                        InvoiceFilter::IssuedBetween { start, end }
                    }
                    (None, None, None, None) => InvoiceFilter::All,
                };
                print_json(&self.engine.list_invoices(filter).await?)
            }
            InvoiceCommand::Overdue => print_json(&self.engine.find_overdue_invoices().await?),
            InvoiceCommand::Refresh { invoice: Some(invoice) } => {
                let id = self.invoice_id(&invoice).await?;
                print_json(&self.engine.refresh_invoice_status(id).await?)
            }
            InvoiceCommand::Refresh { invoice: None } => {
                let changed = self.engine.refresh_overdue_invoices().await?;
                tracing::info!(changed = changed.len(), "Refreshed invoice statuses");
                print_json(&changed)
            }
            InvoiceCommand::Issue { invoice } => {
                let id = self.invoice_id(&invoice).await?;
                print_json(&self.engine.issue_invoice(id).await?)
            }
            InvoiceCommand::Cancel { invoice } => {
                let id = self.invoice_id(&invoice).await?;
                print_json(&self.engine.cancel_invoice(id).await?)
            }
            InvoiceCommand::Delete { invoice } => {
                let id = self.invoice_id(&invoice).await?;
                self.engine.delete_invoice(id).await?;
                print_json(&serde_json::json!({ "deleted": id }))
            }
            InvoiceCommand::NextNumber => print_json(&serde_json::json!({
                "next_invoice_number": self.engine.next_invoice_number().await?,
            })),
        }
    }

    async fn run_payment(&self, command: PaymentCommand) -> anyhow::Result<()> {
        match command {
            PaymentCommand::Record {
                invoice,
                amount,
                method,
                date,
                reference,
                notes,
            } => {
                let invoice_id = self.invoice_id(&invoice).await?;
                let payment = self
                    .engine
                    .record_payment(RecordPaymentRequest {
                        invoice_id,
                        amount,
                        method,
                        payment_date: date,
                        reference,
                        notes,
                    })
                    .await?;
                print_json(&payment)
            }
            PaymentCommand::Edit {
                payment,
                amount,
                method,
                date,
                reference,
                notes,
            } => {
                let id = self.payment_id(&payment).await?;
                let updated = self
                    .engine
                    .update_payment(
                        id,
                        PaymentChanges {
                            payment_date: date,
                            amount,
                            method,
                            reference: reference.map(Some),
                            notes: notes.map(Some),
                        },
                    )
                    .await?;
                print_json(&updated)
            }
            PaymentCommand::Delete { payment } => {
                let id = self.payment_id(&payment).await?;
                print_json(&self.engine.delete_payment(id).await?)
            }
            PaymentCommand::List {
                invoice,
                client,
                method,
                range,
            } => {
                let filter = match (invoice, client, method, range.bounds()) {
                    (Some(invoice), _, _, _) => PaymentFilter::Invoice(self.invoice_id(&invoice).await?),
                    (None, Some(client), _, _) => PaymentFilter::Client(client),
                    (None, None, Some(method), _) => PaymentFilter::Method(method),
                    (None, None, None, Some((start, end))) => {
                        PaymentFilter::DateRange { start, end }
                    }
                    (None, None, None, None) => PaymentFilter::All,
                };
                print_json(&self.engine.list_payments(filter).await?)
            }
            PaymentCommand::Total { client, range } => {
                let total = match (client, range.bounds()) {
                    (Some(client), _) => self.engine.total_payments_for_client(&client).await?,
                    (None, Some((start, end))) => {
                        self.engine.total_payments_between(start, end).await?
                    }
                    (None, None) => anyhow::bail!("pass --client or --from/--to"),
                };
                print_json(&serde_json::json!({
                    "total": total,
                    "formatted": format_money(total, &self.engine.config().currency_symbol),
                }))
            }
        }
    }

    fn print_invoice(&self, details: &InvoiceDetails) {
        let symbol = self.engine.config().currency_symbol.as_str();
        let invoice = &details.invoice;
        println!(
            "Invoice {} [{}]",
            invoice.invoice_number,
            invoice.status.label()
        );
        println!(
            "  Client:  {}",
            details.client_name.as_deref().unwrap_or(&invoice.client_id)
        );
        println!("  Case:    {}", invoice.case_id);
        println!("  Issued:  {}   Due: {}", invoice.issue_date, invoice.due_date);
        for entry in &details.time_entries {
            println!(
                "  {} {} {:>6} {} {}",
                entry.entry_code,
                entry.entry_date,
                format_hours(entry.hours),
                entry.activity_code.description(),
                entry.description
            );
        }
        for payment in &details.payments {
            println!(
                "  {} {} {} {}",
                payment.payment_number,
                payment.payment_date,
                payment.method.label(),
                format_money(payment.amount, symbol)
            );
        }
        println!("  Amount:  {}", format_money(invoice.amount, symbol));
        println!("  Paid:    {}", format_money(invoice.amount_paid, symbol));
        println!("  Balance: {}", format_money(details.balance, symbol));
    }

    async fn run_report(&self, command: ReportCommand) -> anyhow::Result<()> {
        match command {
            ReportCommand::Case { case, text: false } => {
                print_json(&self.engine.case_billing_summary(&case).await?)
            }
            ReportCommand::Case { case, text: true } => {
                let summary = self.engine.case_billing_summary(&case).await?;
                let symbol = self.engine.config().currency_symbol.as_str();
                println!(
                    "Case {} (client {})",
                    summary.case_id,
                    summary.client_name.as_deref().unwrap_or(&summary.client_id)
                );
                println!(
                    "  Time logged:  {} ({} billable)",
                    format_hours(summary.total_hours),
                    format_money(summary.billable_amount, symbol)
                );
                println!(
                    "  Unbilled:     {} ({})",
                    format_hours(summary.unbilled_hours),
                    format_money(summary.unbilled_amount, symbol)
                );
                println!(
                    "  Invoiced:     {} across {} invoice(s), {} overdue",
                    format_money(summary.invoiced_amount, symbol),
                    summary.invoice_count,
                    summary.overdue_count
                );
                println!(
                    "  Collected:    {}",
                    format_money(summary.collected_amount, symbol)
                );
                println!(
                    "  Outstanding:  {}",
                    format_money(summary.outstanding_amount, symbol)
                );
                Ok(())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.logging);

    let directory = match cli.directory.as_ref().or(config.directory_path.as_ref()) {
        Some(path) => InMemoryDirectory::load(path)
            .with_context(|| format!("failed to load practice directory {}", path.display()))?,
        None => {
            tracing::warn!("No practice directory configured; case lookups will fail");
            InMemoryDirectory::new()
        }
    };

    tracing::debug!(backend = config.database.backend.as_str(), "Connecting to database");
    let db = casebill::db::connect_from_config(&config.database)
        .await
        .context("failed to open billing database")?;

    let engine = BillingEngine::new(db, Arc::new(directory), config.billing);
    App { engine }.run(cli.command).await
}
