use certa_common::types::{RequestStatus, RequestType};
use certa_db::storage::{RequestFilter, RequestStore, Storage};
use clap::Parser;

#[derive(Clone, Parser)]
pub struct ListRequestsParams {
    #[clap(short, long)]
    pub status: Option<RequestStatus>,

    #[clap(short = 't', long = "type")]
    pub request_type: Option<RequestType>,

    #[clap(long, default_value_t = 0)]
    pub start: usize,

    #[clap(long, default_value_t = 50)]
    pub size: usize,
}

pub async fn list_requests(stg: &dyn Storage, params: ListRequestsParams) -> anyhow::Result<()> {
    let filter = RequestFilter {
        status: params.status,
        request_type: params.request_type,
        ..Default::default()
    };
    let page = RequestStore::list(stg, filter, params.start, params.size).await?;

    for request in &page.items {
        println!(
            "{:>8}  {:<12} {:<11} {:<24} {}",
            request.id.to_string(),
            request.request_type.as_str(),
            request.status.as_str(),
            request.owner.as_deref().unwrap_or("-"),
            request.created_at.to_rfc3339(),
        );
    }
    println!("{} of {} requests", page.items.len(), page.total);
    Ok(())
}
