use clap::Args;
use renova_sync_core::{Record, RecordId, SyncEngine, WriteReceipt};

use super::{CommandError, OutputFormat};

/// Create or replace a record
#[derive(Args)]
pub struct PutCommand {
    /// Collection name (e.g. crm_clientes)
    pub collection: String,

    /// Record as a JSON object with an "id" field
    pub json: String,
}

impl PutCommand {
    pub async fn run(&self, engine: &SyncEngine) -> Result<(), CommandError> {
        let record = parse_record(&self.json)?;
        let receipt = engine.put(&self.collection, record).await?;
        print_receipt(&receipt);
        Ok(())
    }
}

/// Delete a record by id
#[derive(Args)]
pub struct DeleteCommand {
    /// Collection name
    pub collection: String,

    /// Record id
    pub id: String,
}

impl DeleteCommand {
    pub async fn run(&self, engine: &SyncEngine) -> Result<(), CommandError> {
        if self.id.is_empty() {
            return Err(CommandError::InvalidInput("id must not be empty".into()));
        }
        let receipt = engine
            .delete(&self.collection, &RecordId::from(self.id.as_str()))
            .await?;
        print_receipt(&receipt);
        Ok(())
    }
}

/// List the records of a collection
#[derive(Args)]
pub struct ListCommand {
    /// Collection name
    pub collection: String,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl ListCommand {
    pub fn run(&self, engine: &SyncEngine) -> Result<(), CommandError> {
        let records = engine.list(&self.collection)?;

        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            OutputFormat::Text => {
                if records.is_empty() {
                    println!("No records in {}.", self.collection);
                    return Ok(());
                }
                for record in &records {
                    println!("{}  {}", record.id(), serde_json::to_string(record)?);
                }
                println!();
                println!("{} record(s)", records.len());
            }
        }
        Ok(())
    }
}

/// Parses a JSON object into a record.
pub fn parse_record(json: &str) -> Result<Record, CommandError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| CommandError::InvalidInput(format!("not valid JSON: {}", e)))?;
    Record::from_value(value).map_err(|e| CommandError::InvalidInput(e.to_string()))
}

fn print_receipt(receipt: &WriteReceipt) {
    let queued = match &receipt.queued {
        Some(item) => format!("queued as {}", item.id),
        None => "not queued".to_string(),
    };
    println!(
        "✓ {} {}/{} ({})",
        receipt.operation,
        receipt.collection,
        receipt.record.id(),
        queued
    );
}
