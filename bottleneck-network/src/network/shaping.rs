use crate::network::TopologyError;
use bon::bon;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// The queueing discipline used to realize a link's shaping parameters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShapingDiscipline {
    /// A token bucket filter enforces the bandwidth, the remaining impairments are chained below
    TokenBucket,
    /// A single hierarchical token bucket class enforces the bandwidth
    HierarchicalTokenBucket,
}

/// Quality-of-service emulation parameters for a single link
///
/// Every field is optional. A descriptor without any field set leaves the link unshaped (i.e. it
/// runs at line rate, without added delay or loss). As soon as one of the fields is set, a
/// [`ShapingDiscipline`] must be selected so the backend knows how to realize it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinkShaping {
    bandwidth_mbps: Option<f64>,
    delay: Option<Duration>,
    jitter: Option<Duration>,
    loss_percent: Option<f64>,
    max_queue_packets: Option<u32>,
    discipline: Option<ShapingDiscipline>,
}

#[bon]
impl LinkShaping {
    #[builder]
    pub fn new(
        /// The bandwidth ceiling, in megabits per second
        bandwidth_mbps: Option<f64>,
        /// The one-way delay applied to every packet
        delay: Option<Duration>,
        /// Random variation of the delay (requires `delay`)
        jitter: Option<Duration>,
        /// The probability that a packet is lost, between 0 and 100
        loss_percent: Option<f64>,
        /// The maximum amount of packets buffered before tail drop kicks in
        max_queue_packets: Option<u32>,
        discipline: Option<ShapingDiscipline>,
    ) -> Result<Self, TopologyError> {
        let invalid = |reason: String| TopologyError::InvalidShapingConfig { reason };

        if let Some(bandwidth) = bandwidth_mbps {
            if !bandwidth.is_finite() || bandwidth <= 0.0 {
                return Err(invalid(format!(
                    "bandwidth must be a positive number of Mbps (got {bandwidth})"
                )));
            }
        }

        if let Some(loss) = loss_percent {
            if !(0.0..=100.0).contains(&loss) {
                return Err(invalid(format!(
                    "loss must be between 0 and 100 percent (got {loss})"
                )));
            }
        }

        if max_queue_packets == Some(0) {
            return Err(invalid("the maximum queue size must be positive".to_string()));
        }

        if jitter.is_some() && delay.is_none() {
            return Err(invalid("jitter requires a delay".to_string()));
        }

        let shaping = Self {
            bandwidth_mbps,
            delay,
            jitter,
            loss_percent,
            max_queue_packets,
            discipline,
        };

        if shaping.has_parameters() && discipline.is_none() {
            return Err(invalid(
                "shaping parameters were provided, but no shaping discipline was selected"
                    .to_string(),
            ));
        }

        Ok(shaping)
    }

    /// A link without any shaping, running at line rate
    pub fn unshaped() -> Self {
        Self::default()
    }
}

impl LinkShaping {
    fn has_parameters(&self) -> bool {
        self.bandwidth_mbps.is_some()
            || self.delay.is_some()
            || self.jitter.is_some()
            || self.loss_percent.is_some()
            || self.max_queue_packets.is_some()
    }

    /// True if the link should be left at its defaults
    pub fn is_unshaped(&self) -> bool {
        !self.has_parameters()
    }

    pub fn bandwidth_mbps(&self) -> Option<f64> {
        self.bandwidth_mbps
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn jitter(&self) -> Option<Duration> {
        self.jitter
    }

    pub fn loss_percent(&self) -> f64 {
        self.loss_percent.unwrap_or(0.0)
    }

    pub fn max_queue_packets(&self) -> Option<u32> {
        self.max_queue_packets
    }

    pub fn discipline(&self) -> Option<ShapingDiscipline> {
        self.discipline
    }
}

impl Display for LinkShaping {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_unshaped() {
            return f.write_str("unshaped");
        }

        let mut parts = Vec::new();
        if let Some(bandwidth) = self.bandwidth_mbps {
            parts.push(format!("{bandwidth} Mbps"));
        }
        if let Some(delay) = self.delay {
            let delay = format_duration(delay);
            match self.jitter {
                Some(jitter) => parts.push(format!(
                    "{delay} delay (+/- {})",
                    format_duration(jitter)
                )),
                None => parts.push(format!("{delay} delay")),
            }
        }
        if self.loss_percent.is_some() {
            parts.push(format!("{}% loss", self.loss_percent()));
        }
        if let Some(queue) = self.max_queue_packets {
            parts.push(format!("queue {queue} packets"));
        }
        match self.discipline {
            Some(ShapingDiscipline::TokenBucket) => parts.push("tbf".to_string()),
            Some(ShapingDiscipline::HierarchicalTokenBucket) => parts.push("htb".to_string()),
            None => {}
        }

        f.write_str(&parts.join(", "))
    }
}

/// Whole milliseconds when exact, microseconds otherwise (the units `tc` understands)
pub(crate) fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    if micros % 1000 == 0 {
        format!("{}ms", micros / 1000)
    } else {
        format!("{micros}us")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reason(result: Result<LinkShaping, TopologyError>) -> String {
        match result {
            Err(TopologyError::InvalidShapingConfig { reason }) => reason,
            other => panic!("expected InvalidShapingConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_bottleneck_shaping() {
        let shaping = LinkShaping::builder()
            .bandwidth_mbps(10.0)
            .delay(Duration::from_millis(20))
            .loss_percent(0.0)
            .max_queue_packets(10_000)
            .discipline(ShapingDiscipline::TokenBucket)
            .build()
            .unwrap();

        assert!(!shaping.is_unshaped());
        assert_eq!(shaping.bandwidth_mbps(), Some(10.0));
        assert_eq!(shaping.delay(), Some(Duration::from_millis(20)));
        assert_eq!(shaping.loss_percent(), 0.0);
        assert_eq!(shaping.max_queue_packets(), Some(10_000));
        assert_eq!(
            shaping.to_string(),
            "10 Mbps, 20ms delay, 0% loss, queue 10000 packets, tbf"
        );
    }

    #[test]
    fn test_no_parameters_means_unshaped() {
        let shaping = LinkShaping::builder().build().unwrap();
        assert!(shaping.is_unshaped());
        assert_eq!(shaping, LinkShaping::unshaped());
        assert_eq!(shaping.loss_percent(), 0.0);
        assert_eq!(shaping.to_string(), "unshaped");

        // Selecting a discipline without parameters is harmless
        let shaping = LinkShaping::builder()
            .discipline(ShapingDiscipline::HierarchicalTokenBucket)
            .build()
            .unwrap();
        assert!(shaping.is_unshaped());
    }

    #[test]
    fn test_loss_out_of_range() {
        for loss in [-0.1, 100.5, f64::NAN] {
            let result = LinkShaping::builder()
                .loss_percent(loss)
                .discipline(ShapingDiscipline::TokenBucket)
                .build();
            assert!(reason(result).contains("loss"));
        }

        let edge = LinkShaping::builder()
            .loss_percent(100.0)
            .discipline(ShapingDiscipline::TokenBucket)
            .build();
        assert!(edge.is_ok());
    }

    #[test]
    fn test_parameters_without_discipline() {
        let result = LinkShaping::builder().bandwidth_mbps(100.0).build();
        assert!(reason(result).contains("discipline"));

        let result = LinkShaping::builder()
            .delay(Duration::from_millis(0))
            .build();
        assert!(reason(result).contains("discipline"));
    }

    #[test]
    fn test_non_positive_values() {
        for bandwidth in [0.0, -10.0, f64::INFINITY] {
            let result = LinkShaping::builder()
                .bandwidth_mbps(bandwidth)
                .discipline(ShapingDiscipline::TokenBucket)
                .build();
            assert!(reason(result).contains("bandwidth"));
        }

        let result = LinkShaping::builder()
            .max_queue_packets(0)
            .discipline(ShapingDiscipline::TokenBucket)
            .build();
        assert!(reason(result).contains("queue"));
    }

    #[test]
    fn test_jitter_requires_delay() {
        let result = LinkShaping::builder()
            .jitter(Duration::from_millis(5))
            .discipline(ShapingDiscipline::TokenBucket)
            .build();
        assert!(reason(result).contains("jitter"));
    }

    #[test]
    fn test_sub_millisecond_delays() {
        assert_eq!(format_duration(Duration::from_millis(20)), "20ms");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1500us");

        let shaping = LinkShaping::builder()
            .delay(Duration::from_micros(500))
            .jitter(Duration::from_micros(250))
            .discipline(ShapingDiscipline::TokenBucket)
            .build()
            .unwrap();
        assert_eq!(shaping.to_string(), "500us delay (+/- 250us), tbf");
    }
}
