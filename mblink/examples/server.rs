//! Example slave that serves a small coil map over a TCP listener

use mblink::{EndpointRegistry, Pdu, RequestHandler, ServerConfig, UnitId};

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

struct SimpleHandler {
    unit: UnitId,
    coils: Vec<bool>,
}

impl SimpleHandler {
    fn new(unit: UnitId, coils: Vec<bool>) -> Self {
        Self { unit, coils }
    }

    fn exception(request: &Pdu, code: u8) -> Option<Pdu> {
        Some(Pdu::new(request.function() | 0x80, vec![code]))
    }

    fn read_coils(&self, request: &Pdu) -> Option<Pdu> {
        let (start, count) = match request.data() {
            [s_hi, s_lo, c_hi, c_lo] => (
                u16::from_be_bytes([*s_hi, *s_lo]) as usize,
                u16::from_be_bytes([*c_hi, *c_lo]) as usize,
            ),
            _ => return Self::exception(request, ILLEGAL_DATA_ADDRESS),
        };

        let coils = match self.coils.get(start..start + count) {
            Some(x) if count > 0 => x,
            _ => return Self::exception(request, ILLEGAL_DATA_ADDRESS),
        };

        let mut data = vec![coils.len().div_ceil(8) as u8];
        data.resize(1 + coils.len().div_ceil(8), 0);
        for (index, coil) in coils.iter().enumerate() {
            if *coil {
                data[1 + index / 8] |= 1 << (index % 8);
            }
        }
        Some(Pdu::new(request.function(), data))
    }
}

impl RequestHandler for SimpleHandler {
    fn process(&mut self, unit: UnitId, request: &Pdu) -> Option<Pdu> {
        if unit != self.unit && !unit.is_broadcast() {
            // addressed to some other device on the line
            return None;
        }

        match request.function() {
            0x01 => self.read_coils(request),
            _ => Self::exception(request, ILLEGAL_FUNCTION),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let handler = SimpleHandler::new(UnitId::new(0x01), vec![true; 10]);

    let registry = EndpointRegistry::new();
    let registration = registry
        .create_or_get_tcp(
            "127.0.0.1:502".parse()?,
            ServerConfig::default(),
            mblink::shared(handler),
        )
        .await?;

    println!("serving {}, press ctrl-c to exit", registration.key());
    tokio::signal::ctrl_c().await?;

    registry.close_all().await;
    Ok(())
}
