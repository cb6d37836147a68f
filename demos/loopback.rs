//! Runs a terminal against an in-memory chip.
//!
//! The document number, birth date and expiry date default to the ICAO
//! specimen and can be overridden with `DOCNO`, `BIRTHDATE` and
//! `EXPIRYDATE`.

use std::env;

use mrtd_bac::{
    bytes2hex, BacError, BacReader, MemoryFileStore, PassportApplet, StaticKeys, EF_COM, EF_DG1,
};
use tracing::info;

const EF_COM_DATA: &[u8] = &[
    0x60, 0x14, 0x5F, 0x01, 0x04, 0x30, 0x31, 0x30, 0x36, 0x5F, 0x36, 0x06, 0x30, 0x34, 0x30,
    0x30, 0x30, 0x30, 0x5C, 0x02, 0x61, 0x75,
];

fn main() -> Result<(), BacError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let doc_no = env::var("DOCNO").unwrap_or_else(|_| "L898902C<".to_owned());
    let birthdate = env::var("BIRTHDATE").unwrap_or_else(|_| "690806".to_owned());
    let expirydate = env::var("EXPIRYDATE").unwrap_or_else(|_| "940623".to_owned());
    let keys = StaticKeys::from_mrz(&doc_no, &birthdate, &expirydate)?;

    let mut mrz = b"P<UTOERIKSSON<<ANNA<MARIA".to_vec();
    mrz.resize(88, b'<');
    let ef_dg1 = [&[0x61, 0x5B, 0x5F, 0x1F, 0x58][..], &mrz].concat();

    let mut chip = PassportApplet::new(MemoryFileStore::lds(), keys.clone());
    chip.personalize(EF_COM, EF_COM_DATA)?;
    chip.personalize(EF_DG1, &ef_dg1)?;
    chip.lock();

    let mut reader = BacReader::new(chip);
    reader.select_emrtd_application()?;
    reader.establish_bac_session_keys(&keys)?;

    reader.select_ef(EF_COM, "EF.COM", true)?;
    let ef_com = reader.read_data_from_ef(true)?;
    info!("Data from the EF.COM: {}", bytes2hex(&ef_com));

    reader.select_ef(EF_DG1, "EF.DG1", true)?;
    let ef_dg1 = reader.read_data_from_ef(true)?;
    info!("Data from the EF.DG1: {}", bytes2hex(&ef_dg1));
    info!("SSC after reading: {:016X}", reader.ssc().unwrap_or_default());

    reader.close_session();
    Ok(())
}
