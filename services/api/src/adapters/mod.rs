pub mod db;
pub mod generation_llm;
pub mod identity;
pub mod memory;

pub use db::DbAdapter;
pub use generation_llm::OpenAiGenerationAdapter;
pub use identity::JwtIdentityAdapter;
pub use memory::InMemoryDatabase;
