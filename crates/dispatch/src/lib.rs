//! Campaign dispatch: batched, paced delivery of personalized messages
//! through an abstract vendor, with campaign lifecycle supervision.

pub mod dispatcher;
pub mod service;
pub mod vendor;

pub use dispatcher::{CampaignDispatcher, DispatchSettings};
pub use service::{CampaignReport, CampaignService, NewCampaign};
pub use vendor::{OutboundMessage, SimulatedVendor, VendorAck, VendorClient, VendorError};
