use serde::Serialize;
use tunnel_core::CongestionControl;

/// 本传输绑定的能力描述，宿主据此决定可用的通道与拥塞控制算法。
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Capabilities {
    pub implementation: &'static str,
    pub datagrams: bool,
    pub streams: bool,
    pub congestion_controls: Vec<&'static str>,
}

impl Capabilities {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn capabilities() -> Capabilities {
    Capabilities {
        implementation: "quinn",
        datagrams: true,
        streams: true,
        congestion_controls: CongestionControl::ALL
            .iter()
            .map(|algorithm| algorithm.as_str())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_every_congestion_controller() {
        let json = capabilities().to_json().expect("json");
        assert_eq!(
            json,
            r#"{"implementation":"quinn","datagrams":true,"streams":true,"congestion_controls":["newreno","cubic","bbr"]}"#
        );
    }
}
