use std::env;
use std::process;

use mrtd_bac::{
    bytes2hex, wait_for_card, BacError, BacReader, PcscReader, PollConfig, StaticKeys, EF_COM,
    EF_DG1, EF_SOD,
};
use tracing::{error, info};

fn mrz_field(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| {
        error!("Please set {name} environment variable");
        process::exit(1);
    })
}

fn main() -> Result<(), BacError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    // Use the first reader.
    let mut pcsc_reader = PcscReader::first_available()?;

    // Wait for a document to be placed on the reader.
    if !wait_for_card(&mut pcsc_reader, true, &PollConfig::default(), None)? {
        error!("A smartcard is not present in the reader.");
        process::exit(1);
    }
    let card = pcsc_reader.connect()?;

    let mut reader = BacReader::new(card);

    // Select eMRTD application
    reader.select_emrtd_application()?;

    let doc_no = mrz_field("DOCNO");
    let birthdate = mrz_field("BIRTHDATE");
    let expirydate = mrz_field("EXPIRYDATE");
    let keys = StaticKeys::from_mrz(&doc_no, &birthdate, &expirydate)?;

    reader.establish_bac_session_keys(&keys)?;

    // Read EF.COM
    reader.select_ef(EF_COM, "EF.COM", true)?;
    let ef_com = reader.read_data_from_ef(true)?;
    info!("Data from the EF.COM: {}", bytes2hex(&ef_com));

    // Read EF.SOD
    reader.select_ef(EF_SOD, "EF.SOD", true)?;
    let ef_sod = reader.read_data_from_ef(true)?;
    info!("Data from the EF.SOD: {}", bytes2hex(&ef_sod));

    // Read EF.DG1
    reader.select_ef(EF_DG1, "EF.DG1", true)?;
    let ef_dg1 = reader.read_data_from_ef(true)?;
    info!("Data from the EF.DG1: {}", bytes2hex(&ef_dg1));

    reader.close_session();
    Ok(())
}
