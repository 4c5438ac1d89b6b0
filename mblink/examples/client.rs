//! Example master that polls coils over the transport named on the command
//! line (`tcp`, `udp`, `rtu`, or `ascii`)

use std::process::exit;
use std::time::Duration;

use mblink::{
    Pdu, SerialEncoding, SerialSettings, TransactionEngine, TransactionOptions, Transport,
    TransportOptions, UnitId,
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let transport: &str = match &args[..] {
        [_, x] => x,
        _ => {
            eprintln!("usage: client <transport> (tcp, udp, rtu, ascii)");
            exit(-1);
        }
    };

    let transport = match transport {
        "tcp" => Transport::tcp("127.0.0.1:502".parse()?, TransportOptions::default()),
        "udp" => Transport::udp("127.0.0.1:502".parse()?, TransportOptions::default()),
        "rtu" => Transport::serial(
            "/dev/ttySIM0",
            SerialSettings::default(),
            TransportOptions::default(),
        )?,
        "ascii" => Transport::serial(
            "/dev/ttySIM0",
            SerialSettings {
                encoding: SerialEncoding::Ascii,
                ..Default::default()
            },
            TransportOptions::default(),
        )?,
        _ => {
            eprintln!("unknown transport '{transport}', options are (tcp, udp, rtu, ascii)");
            exit(-1);
        }
    };

    let mut engine = TransactionEngine::new(transport, TransactionOptions::default());

    // poll for ten coils starting at address zero every 3 seconds
    loop {
        let request = Pdu::new(0x01, vec![0x00, 0x00, 0x00, 0x0A]);
        match engine.execute(UnitId::new(0x01), request).await {
            Ok(response) => println!("response: {response}"),
            Err(err) => println!("error: {err}"),
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}
