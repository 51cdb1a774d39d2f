use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::models::{RefundPolicy, SchedulingPolicy};

/// Maps cancellation timing to a fee/refund split.
///
/// | cancelled                          | fee  | refund |
/// |------------------------------------|------|--------|
/// | 2h or more before `slot_start`     | 0%   | 100%   |
/// | less than 2h before `slot_start`   | 50%  | 50%    |
/// | at or after `slot_start`, no-show  | 100% | 0%     |
pub struct RefundCalculator {
    late_window: Duration,
    late_fee_percent: u8,
    no_show_fee_percent: u8,
}

impl RefundCalculator {
    pub fn new(policy: &SchedulingPolicy) -> Self {
        Self {
            late_window: policy.late_cancellation_window,
            late_fee_percent: policy.late_cancellation_fee_percent,
            no_show_fee_percent: policy.no_show_fee_percent,
        }
    }

    pub fn compute_refund(&self, slot_start: DateTime<Utc>, cancel_time: DateTime<Utc>) -> RefundPolicy {
        let notice = slot_start - cancel_time;

        let policy = if notice <= Duration::zero() {
            self.no_show()
        } else if notice >= self.late_window {
            // exactly at the window boundary is still a free cancellation
            RefundPolicy::with_fee(0)
        } else {
            RefundPolicy::with_fee(self.late_fee_percent)
        };

        debug!(
            "Cancellation {} minutes before slot: fee {}%, refund {}%",
            notice.num_minutes(),
            policy.fee_percent,
            policy.refund_percent
        );
        policy
    }

    pub fn no_show(&self) -> RefundPolicy {
        RefundPolicy::with_fee(self.no_show_fee_percent)
    }
}
