// External collaborator contracts and implementations used by step executors

pub mod ai;
pub mod conversations;
pub mod email;
pub mod insights;
pub mod tickets;

pub use ai::{AiAnalysis, AiError, AiReply, AiService};
pub use conversations::ConversationService;
pub use email::EmailService;
pub use insights::{
    AnalyticsService, ChurnAssessment, ChurnService, InsightError, JourneyService,
    JourneySnapshot, SegmentService,
};
pub use tickets::{NewTicket, TicketService};
