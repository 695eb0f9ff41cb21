pub mod answer;
pub mod graph_search;
pub mod rag;
pub mod tokenize;

pub use answer::{memory_query, question_answer, AnswerResult, SourceDocument};
pub use rag::{
    retrieve, DefaultQueryServices, QueryServices, RetrievalConfig, RetrievalMode,
    RetrievalOutcome,
};
pub use tokenize::{fold, tokenize, QueryToken, Stopwords};
