use std::env;

use passport_reader::{bytes2hex, PassportError, PassportReader, PcscChannel, ReaderConfig, TimeoutChannel};
use tracing::{error, info};

fn main() -> Result<(), PassportError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    // Establish a PC/SC context.
    let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("Failed to establish context: {err}");
            std::process::exit(1);
        }
    };

    // List available readers.
    let mut readers_buf = [0; 2048];
    let mut readers = match ctx.list_readers(&mut readers_buf) {
        Ok(readers) => readers,
        Err(err) => {
            error!("Failed to list readers: {err}");
            std::process::exit(1);
        }
    };

    // Use the first reader.
    let Some(reader) = readers.next() else {
        error!("No readers are connected.");
        std::process::exit(1);
    };
    info!("Using reader: {reader:?}");

    // Connect to the card.
    let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(pcsc::Error::NoSmartcard) => {
            error!("A smartcard is not present in the reader.");
            std::process::exit(1);
        }
        Err(err) => {
            error!("Failed to connect to card: {err}");
            std::process::exit(1);
        }
    };

    let channel = PcscChannel::new(card);
    info!("ATR from attribute: {}", bytes2hex(&channel.get_atr()?));

    let doc_no = env::var("DOCNO").expect("Please set DOCNO environment variable");
    let birthdate = env::var("BIRTHDATE").expect("Please set BIRTHDATE environment variable");
    let expirydate = env::var("EXPIRYDATE").expect("Please set EXPIRYDATE environment variable");

    let config = ReaderConfig::default();
    let channel = TimeoutChannel::spawn(channel, config.exchange_timeout);
    let mut reader = PassportReader::new(channel).with_config(config);

    match reader.read(&doc_no, &birthdate, &expirydate) {
        Ok(record) => {
            for mismatch in &record.check_digit_mismatches {
                info!("MRZ warning: {mismatch}");
            }
            println!("{}", record.to_json()?);
            Ok(())
        }
        Err(failure) => {
            error!("{failure}");
            Err(failure.error)
        }
    }
}
