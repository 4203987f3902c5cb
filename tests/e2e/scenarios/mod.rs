mod artifact_cache;
mod compile_flow;
mod maintenance;
mod persistent;
mod queue;
mod repository;
