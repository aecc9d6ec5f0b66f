//! Simulated hardware for `--simulate` and tests.

mod bus;
mod euicc;

pub use bus::{iccid_for, modem_properties, BusCall, SimulatedBus};
pub use euicc::{
    sample_profile, Offer, SimulatedChannel, SimulatedDriver, SimulatedEngine, SimulatedEuicc,
    SIMULATED_SMDP,
};

use simdeck_common::models::NotificationOperation;

use crate::error::Result;
use crate::lpa::aid::{CANDIDATES, GSMA_ISD_R};

/// Everything a simulated deployment is made of.
#[derive(Clone)]
pub struct SimulatedHardware {
    pub bus: SimulatedBus,
    pub driver: SimulatedDriver,
    pub engine: SimulatedEngine,
}

/// Matching id the demo SM-DP+ accepts without a confirmation code.
pub const DEMO_MATCHING_ID: &str = "DEMO-0001";
/// Matching id that additionally requires [`DEMO_CONFIRMATION_CODE`].
pub const DEMO_MATCHING_ID_WITH_CODE: &str = "DEMO-0002";
pub const DEMO_CONFIRMATION_CODE: &str = "1234";

/// Two modems: an MBIM one with a standard eUICC, and an AT-only one whose
/// card answers on a vendor AID.
pub fn demo() -> Result<SimulatedHardware> {
    let bus = SimulatedBus::new();
    let driver = SimulatedDriver::new();
    let engine = SimulatedEngine::new();

    let mbim_imei = "860000000000101";
    bus.plug(modem_properties(mbim_imei, "cdc-wdm0", 7));
    let mbim_card = SimulatedEuicc::new("89049032000000000000000000000101");
    let mut home = sample_profile(&iccid_for(mbim_imei, 1), "Home")?;
    home.state = simdeck_common::models::ProfileState::Enabled;
    mbim_card.add_profile(home);
    let travel = sample_profile(&iccid_for(mbim_imei, 2), "Travel")?;
    mbim_card.push_notification(&travel.iccid, NotificationOperation::Install, SIMULATED_SMDP);
    mbim_card.add_profile(travel);
    mbim_card.add_offer(
        DEMO_MATCHING_ID,
        Offer {
            profile: sample_profile(&iccid_for(mbim_imei, 3), "Roaming")?,
            confirmation_code: None,
        },
    );
    mbim_card.add_offer(
        DEMO_MATCHING_ID_WITH_CODE,
        Offer {
            profile: sample_profile(&iccid_for(mbim_imei, 4), "Business")?,
            confirmation_code: Some(DEMO_CONFIRMATION_CODE.into()),
        },
    );
    mbim_card.add_event(crate::lpa::SMDS_ADDRESSES[0], DEMO_MATCHING_ID, SIMULATED_SMDP);
    engine.insert_card("/dev/cdc-wdm0", GSMA_ISD_R.aid, mbim_card);

    let at_imei = "860000000000202";
    bus.plug(modem_properties(at_imei, "ttyUSB2", 3));
    let at_card = SimulatedEuicc::new("89044045000000000000000000000202");
    let mut data = sample_profile(&iccid_for(at_imei, 1), "Data")?;
    data.state = simdeck_common::models::ProfileState::Enabled;
    at_card.add_profile(data);
    engine.insert_card("/dev/ttyUSB2", CANDIDATES[1].aid, at_card);

    Ok(SimulatedHardware {
        bus,
        driver,
        engine,
    })
}
