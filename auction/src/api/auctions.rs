//! Auction endpoints:
//!
//! - `POST /api/auctions` - list an auction
//! - `GET /api/auctions/:id` - read from the authority
//! - `PUT /api/auctions/:id` - change item details
//! - `DELETE /api/auctions/:id` - remove
//! - `GET /api/auctions/:id/snapshot` - bid validation gateway
//! - `GET|POST /api/auctions/:id/bids` - list and place bids

use super::error::ApiError;
use super::state::AppState;
use crate::gateway::AuctionSnapshot;
use crate::model::{Auction, Bid};
use crate::service::{CreateAuction, UpdateAuction};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

/// Body of `POST /api/auctions/:id/bids`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBid {
    /// Bidder username
    pub bidder: String,
    /// Offered amount
    pub amount: i64,
}

/// List an auction.
///
/// # Errors
///
/// `400` for an invalid request, `503` if the authority is unavailable.
pub async fn create_auction(
    State(state): State<AppState>,
    Json(request): Json<CreateAuction>,
) -> Result<(StatusCode, Json<Auction>), ApiError> {
    let auction = state.auctions.create(request).await?;
    Ok((StatusCode::CREATED, Json(auction)))
}

/// Read one auction from the authority.
///
/// # Errors
///
/// `404` if there is no such auction.
pub async fn get_auction(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Auction>, ApiError> {
    Ok(Json(state.auctions.get(id).await?))
}

/// Change item details.
///
/// # Errors
///
/// `404` if there is no such auction, `409` if it kept changing concurrently.
pub async fn update_auction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateAuction>,
) -> Result<Json<Auction>, ApiError> {
    Ok(Json(state.auctions.update(id, request).await?))
}

/// Remove an auction.
///
/// # Errors
///
/// `404` if there is no such auction.
pub async fn delete_auction(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.auctions.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Authority facts for bid validation.
///
/// ```bash
/// curl http://localhost:8080/api/auctions/550e8400-e29b-41d4-a716-446655440000/snapshot
/// # {"reservePrice":20000,"seller":"bob","auctionEnd":"...","currentHighBid":null}
/// ```
///
/// # Errors
///
/// `404` for an unknown auction, `408` if the authority does not answer in time.
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AuctionSnapshot>, ApiError> {
    Ok(Json(state.gateway.snapshot(id).await?))
}

/// Place a bid.
///
/// # Errors
///
/// `404`/`408` from the gateway, `400` for a refused bid.
pub async fn place_bid(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PlaceBid>,
) -> Result<(StatusCode, Json<Bid>), ApiError> {
    let bid = state.bids.place_bid(id, &request.bidder, request.amount).await?;
    Ok((StatusCode::CREATED, Json(bid)))
}

/// Bids for an auction, highest first.
///
/// # Errors
///
/// `503` if the bid store cannot be read.
pub async fn list_bids(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Vec<Bid>>, ApiError> {
    Ok(Json(state.bids.bids_for(id).await?))
}
